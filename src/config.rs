//! Demo coordinator - configuration module
//!
//! Environment-driven configuration with startup logging. Secrets
//! (SESSION_SECRET, workload credentials) are never logged.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

/// Multiplier for the estimated-wait strings shown to queued clients.
pub const AVERAGE_SESSION_MINUTES: u64 = 45;

/// Window after the active holder disconnects during which a matching
/// reconnect preserves the session.
pub const DISCONNECT_GRACE_MS: u64 = 10_000;

/// Extra TTL kept on invite records past their expiry, for audit reads.
pub const AUDIT_RETENTION_DAYS: i64 = 30;

/// Minutes before the soft timeout at which session_warning is emitted.
pub const WARNING_BEFORE_TIMEOUT_MINUTES: u64 = 5;

/// Grace beyond the soft timeout before the subprocess is force-killed.
pub const HARD_KILL_GRACE_MINUTES: u64 = 5;

/// Environment variables with this prefix are written into the credential
/// file handed to the workload (never placed in the argument vector).
const WORKLOAD_ENV_PREFIX: &str = "WORKLOAD_";

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port for HTTP and the client protocol
    pub port: u16,
    /// Key-value store endpoint
    pub redis_url: String,
    /// Soft session timeout, in minutes
    pub session_timeout_minutes: u64,
    /// Queue bound
    pub max_queue_size: usize,
    /// HMAC key for session tokens
    pub session_secret: String,
    /// Where the coordinator writes the credential file
    pub session_env_host_path: PathBuf,
    /// Path under which the workload sees the credential file
    pub session_env_container_path: PathBuf,
    /// Terminal-sharing binary
    pub ttyd_binary: String,
    /// Fixed port the terminal sharer binds; the reverse proxy forwards it
    pub ttyd_port: u16,
    /// Container image run inside the shared terminal
    pub workload_image: String,
    /// Container memory cap (docker syntax, e.g. "2g")
    pub workload_memory: String,
    /// Container process-count cap
    pub workload_pids_limit: u32,
    /// Credentials propagated into the credential file
    pub workload_env: Vec<(String, String)>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let session_secret = match env::var("SESSION_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                warn!("SESSION_SECRET not set; using an insecure development default");
                "dev-session-secret".to_string()
            }
        };

        // Collect workload credentials; the tuning knobs below are config,
        // not credentials, and stay out of the file.
        let knobs = ["WORKLOAD_IMAGE", "WORKLOAD_MEMORY", "WORKLOAD_PIDS_LIMIT"];
        let mut workload_env: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with(WORKLOAD_ENV_PREFIX) && !knobs.contains(&k.as_str()))
            .collect();
        workload_env.sort();

        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3000),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            session_timeout_minutes: env::var("SESSION_TIMEOUT_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            max_queue_size: env::var("MAX_QUEUE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            session_secret,
            session_env_host_path: env::var("SESSION_ENV_HOST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/demo-session.env")),
            session_env_container_path: env::var("SESSION_ENV_CONTAINER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/demo-session.env")),
            ttyd_binary: env::var("TTYD_BINARY").unwrap_or_else(|_| "ttyd".to_string()),
            ttyd_port: env::var("TTYD_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7681),
            workload_image: env::var("WORKLOAD_IMAGE")
                .unwrap_or_else(|_| "demo-workload:latest".to_string()),
            workload_memory: env::var("WORKLOAD_MEMORY").unwrap_or_else(|_| "2g".to_string()),
            workload_pids_limit: env::var("WORKLOAD_PIDS_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
            workload_env,
        }
    }

    /// Soft session timeout as a Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes * 60)
    }

    /// Offset of the session_warning timer from session start
    pub fn warning_offset(&self) -> Duration {
        let minutes = self
            .session_timeout_minutes
            .saturating_sub(WARNING_BEFORE_TIMEOUT_MINUTES);
        Duration::from_secs(minutes * 60)
    }

    /// Offset of the hard-kill timer from session start
    pub fn hard_kill_offset(&self) -> Duration {
        Duration::from_secs((self.session_timeout_minutes + HARD_KILL_GRACE_MINUTES) * 60)
    }

    /// Reconnect window after the holder disconnects
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(DISCONNECT_GRACE_MS)
    }

    /// Log configuration at startup so operators can confirm it from logs.
    /// SESSION_SECRET and workload credential values are never logged.
    pub fn log_startup(&self) {
        info!(
            "coordinator config: port={}, redis={}, timeout={}m, max_queue={}, ttyd_port={}, image={}",
            self.port,
            self.redis_url,
            self.session_timeout_minutes,
            self.max_queue_size,
            self.ttyd_port,
            self.workload_image
        );
        info!(
            "workload credentials: {} variable(s) configured",
            self.workload_env.len()
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        env::remove_var("PORT");
        env::remove_var("SESSION_TIMEOUT_MINUTES");
        env::remove_var("MAX_QUEUE_SIZE");

        let config = Config::from_env();

        assert_eq!(config.port, 3000);
        assert_eq!(config.session_timeout_minutes, 60);
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.ttyd_port, 7681);
        assert_eq!(config.session_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn test_config_custom_values() {
        env::set_var("PORT", "8080");
        env::set_var("SESSION_TIMEOUT_MINUTES", "30");
        env::set_var("MAX_QUEUE_SIZE", "2");

        let config = Config::from_env();

        assert_eq!(config.port, 8080);
        assert_eq!(config.session_timeout_minutes, 30);
        assert_eq!(config.max_queue_size, 2);

        env::remove_var("PORT");
        env::remove_var("SESSION_TIMEOUT_MINUTES");
        env::remove_var("MAX_QUEUE_SIZE");
    }

    #[test]
    fn test_timer_offsets() {
        env::remove_var("SESSION_TIMEOUT_MINUTES");
        let config = Config::from_env();

        assert_eq!(config.warning_offset(), Duration::from_secs(55 * 60));
        assert_eq!(config.hard_kill_offset(), Duration::from_secs(65 * 60));
        assert_eq!(config.disconnect_grace(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_workload_env_collection() {
        env::set_var("WORKLOAD_ADMIN_PASSWORD", "s3cret");
        env::set_var("WORKLOAD_IMAGE", "img:1"); // knob, not a credential

        let config = Config::from_env();

        assert!(config
            .workload_env
            .iter()
            .any(|(k, v)| k == "WORKLOAD_ADMIN_PASSWORD" && v == "s3cret"));
        assert!(!config.workload_env.iter().any(|(k, _)| k == "WORKLOAD_IMAGE"));

        env::remove_var("WORKLOAD_ADMIN_PASSWORD");
        env::remove_var("WORKLOAD_IMAGE");
    }
}
