//! Demo coordinator - terminal subprocess supervisor
//!
//! Spawns the terminal sharer (ttyd) around the workload container and
//! owns the credential file. Credentials travel through the file, never
//! through the argument vector. The subprocess's own stdio is captured
//! for logs and never forwarded to clients.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;

/// Kill requests routed to the exit watcher that owns the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM: ask the subprocess to exit
    Soft,
    /// SIGKILL: force it down (hard timeout)
    Hard,
}

/// Scoped credential file. Deleting on drop means every session end path,
/// including spawn failure, removes the file.
#[derive(Debug)]
pub struct EnvFileGuard {
    path: PathBuf,
}

impl EnvFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EnvFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("credential file removed: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove credential file: {}", e),
        }
    }
}

/// Spawn errors
#[derive(Debug, Clone)]
pub enum SpawnError {
    CredentialFile(String),
    SpawnFailed(String),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CredentialFile(e) => write!(f, "Failed to write credential file: {}", e),
            Self::SpawnFailed(e) => write!(f, "Failed to spawn terminal subprocess: {}", e),
        }
    }
}

impl std::error::Error for SpawnError {}

/// A spawned terminal subprocess. The coordinator moves `child` into
/// [`supervise`]; kill requests are routed there over a channel.
pub struct SpawnedTerminal {
    pub pid: Option<u32>,
    pub child: Child,
}

/// Write the credential file with owner-only permissions. Contains the
/// recognized workload credentials plus the session id.
pub fn write_credential_file(config: &Config, session_id: Uuid) -> Result<EnvFileGuard, SpawnError> {
    use std::os::unix::fs::OpenOptionsExt;

    let path = config.session_env_host_path.clone();
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| SpawnError::CredentialFile(e.to_string()))?;

    let mut contents = String::new();
    for (key, value) in &config.workload_env {
        contents.push_str(key);
        contents.push('=');
        contents.push_str(value);
        contents.push('\n');
    }
    contents.push_str(&format!("DEMO_SESSION_ID={}\n", session_id));

    file.write_all(contents.as_bytes())
        .map_err(|e| SpawnError::CredentialFile(e.to_string()))?;

    debug!("credential file written: {}", path.display());
    Ok(EnvFileGuard { path })
}

/// Spawn ttyd serving one interactive workload container on the fixed
/// terminal port: one client, accept once then exit, reconnect disabled.
/// The container runs memory- and pid-capped, with no extra capabilities
/// and no privilege escalation.
pub fn spawn_terminal(config: &Config, session_id: Uuid) -> Result<SpawnedTerminal, SpawnError> {
    let short_id = &session_id.to_string()[..8];

    let mut cmd = Command::new(&config.ttyd_binary);
    cmd.arg("--port")
        .arg(config.ttyd_port.to_string())
        .arg("--interface")
        .arg("0.0.0.0")
        .arg("--once")
        .arg("--max-clients")
        .arg("1")
        .arg("-t")
        .arg("disableReconnect=true")
        .arg("docker")
        .arg("run")
        .arg("--rm")
        .arg("-it")
        .arg("--name")
        .arg(format!("demo-workload-{}", short_id))
        .arg("--env-file")
        .arg(&config.session_env_container_path)
        .arg("--memory")
        .arg(&config.workload_memory)
        .arg("--pids-limit")
        .arg(config.workload_pids_limit.to_string())
        .arg("--cap-drop")
        .arg("ALL")
        .arg("--security-opt")
        .arg("no-new-privileges")
        .arg(&config.workload_image)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_output("stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_output("stderr", stderr));
    }

    info!("terminal subprocess spawned: pid={:?}, port={}", pid, config.ttyd_port);
    Ok(SpawnedTerminal { pid, child })
}

async fn drain_output<R>(stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("ttyd {}: {}", stream, line);
    }
}

/// Own the child until it exits, honoring kill requests along the way.
/// The caller learns about the exit from the return, whatever caused it.
pub async fn supervise(
    mut child: Child,
    mut kill_rx: UnboundedReceiver<KillSignal>,
) -> Option<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return status.ok(),
            sig = kill_rx.recv() => match sig {
                Some(KillSignal::Soft) => {
                    if let Some(pid) = child.id() {
                        terminate(pid);
                    }
                }
                Some(KillSignal::Hard) => {
                    warn!("force-killing terminal subprocess");
                    let _ = child.kill().await;
                    return child.wait().await.ok();
                }
                // All signal senders gone; nothing left but to wait.
                None => return child.wait().await.ok(),
            }
        }
    }
}

fn terminate(pid: u32) {
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed (already gone?): {}", pid, e);
    }
}
