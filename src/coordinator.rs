//! Demo coordinator - queue/session state machine
//!
//! The central component. Owns the in-memory FIFO queue, the single
//! active-session slot, both token maps, the disconnect grace window and
//! the reconnect flag. All core state lives under one mutex; store round
//! trips and subprocess spawns happen outside the critical section, and
//! every decision taken across an await is re-checked against fresh state
//! after the lock is re-acquired.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, AVERAGE_SESSION_MINUTES, WARNING_BEFORE_TIMEOUT_MINUTES};
use crate::invite::{self, RejoinContext, SessionAudit, Validation};
use crate::protocol::{estimated_wait, EndReason, ServerMessage};
use crate::store::KeyValueStore;
use crate::supervisor::{self, EnvFileGuard, KillSignal, SpawnedTerminal};
use crate::telemetry::Metrics;
use crate::token;

/// Per-connection lifecycle. `ended` is represented by removal from the
/// clients map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Queued,
    Active,
}

/// One live client connection
struct ClientConn {
    state: ClientState,
    joined_at: Option<Instant>,
    source_addr: IpAddr,
    user_agent: Option<String>,
    invite_token: Option<String>,
    pending_session_token: Option<String>,
    outbound: UnboundedSender<ServerMessage>,
}

/// Pending-token map entry: issued at queue admission, transferred to the
/// session-token map on promotion.
struct PendingToken {
    client_id: Uuid,
    invite_token: Option<String>,
    source_addr: IpAddr,
    created_at: Instant,
}

/// The at-most-one active session
struct ActiveSession {
    session_id: Uuid,
    client_id: Uuid,
    session_token: String,
    invite_token: Option<String>,
    source_addr: IpAddr,
    user_agent: Option<String>,
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    queue_wait_ms: u64,
    kill_tx: Option<UnboundedSender<KillSignal>>,
    env_file: Option<EnvFileGuard>,
    awaiting_reconnect: bool,
    disconnected_at: Option<Instant>,
    errors: Vec<String>,
}

/// Everything the single critical section protects
struct CoreState {
    clients: HashMap<Uuid, ClientConn>,
    queue: VecDeque<Uuid>,
    active: Option<ActiveSession>,
    /// session token -> session id; entries exist while the session does
    session_tokens: HashMap<String, Uuid>,
    /// pending token -> holder; entries exist while the holder is queued
    pending_tokens: HashMap<String, PendingToken>,
    /// guards the reconnect path against concurrent join attempts
    reconnect_in_progress: bool,
}

impl CoreState {
    /// True when a join may take the slot directly: the slot is free and
    /// nobody is queued ahead.
    fn slot_free(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }
}

/// A slot reservation handed from the critical section to the spawn path
struct ReservedSession {
    session_id: Uuid,
    client_id: Uuid,
}

/// Outcome of an auth sub-request token check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAuth {
    /// Token maps to the current active session
    Active { principal: String },
    /// Token is a pending (queued) token
    Pending { principal: String },
    Invalid,
}

/// Snapshot for GET /status
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub queue_size: usize,
    pub session_active: bool,
    pub estimated_wait: String,
    pub max_queue_size: usize,
}

/// Best-effort persistence record under `session:<clientId>`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invite_token: Option<String>,
    source_address: String,
    user_agent: Option<String>,
    queue_wait_ms: u64,
}

fn session_key(client_id: Uuid) -> String {
    format!("session:{}", client_id)
}

fn principal_for(id: Uuid) -> String {
    format!("demo-{}", &id.to_string()[..8])
}

fn emit(client: &ClientConn, msg: ServerMessage) {
    // A closed channel just means the client is gone.
    let _ = client.outbound.send(msg);
}

pub struct Coordinator {
    config: Config,
    metrics: Arc<Metrics>,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<CoreState>,
}

impl Coordinator {
    pub fn new(config: Config, metrics: Arc<Metrics>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            metrics,
            store,
            state: Mutex::new(CoreState {
                clients: HashMap::new(),
                queue: VecDeque::new(),
                active: None,
                session_tokens: HashMap::new(),
                pending_tokens: HashMap::new(),
                reconnect_in_progress: false,
            }),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Register a freshly opened connection and hand back its outbound
    /// frame stream. The `status` snapshot is the first frame.
    pub async fn register_client(
        &self,
        source_addr: IpAddr,
        user_agent: Option<String>,
    ) -> (Uuid, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = Uuid::new_v4();
        let mut st = self.state.lock().await;

        let client = ClientConn {
            state: ClientState::Connected,
            joined_at: None,
            source_addr,
            user_agent,
            invite_token: None,
            pending_session_token: None,
            outbound: tx,
        };
        emit(
            &client,
            ServerMessage::Status {
                queue_size: st.queue.len(),
                session_active: st.active.is_some(),
            },
        );
        st.clients.insert(client_id, client);
        info!("client {} connected from {}", client_id, source_addr);
        (client_id, rx)
    }

    /// Deliver a frame to one client, if it is still connected
    pub async fn send_to(&self, client_id: Uuid, msg: ServerMessage) {
        let st = self.state.lock().await;
        if let Some(client) = st.clients.get(&client_id) {
            emit(client, msg);
        }
    }

    /// Handle a join_queue intent: validate the invite, then admit,
    /// queue, or recognize a reconnect.
    pub async fn handle_join(self: &Arc<Self>, client_id: Uuid, invite_token: Option<String>) {
        // Snapshot what the store round trip needs, then drop the lock.
        let (source_addr, rejoin_ctx) = {
            let st = self.state.lock().await;
            let Some(client) = st.clients.get(&client_id) else {
                return;
            };
            (client.source_addr, rejoin_context(&st))
        };

        let validation = match &invite_token {
            Some(tok) => Some(
                invite::validate(
                    self.store.as_ref(),
                    tok,
                    source_addr,
                    &rejoin_ctx,
                    &self.metrics,
                    true,
                )
                .await,
            ),
            None => None,
        };

        // Decide against fresh state; the client may have vanished and the
        // slot may have changed while the store was consulted.
        let mut st = self.state.lock().await;
        let Some(client_state) = st.clients.get(&client_id).map(|c| c.state) else {
            return;
        };
        match client_state {
            ClientState::Queued => {
                if let Some(client) = st.clients.get(&client_id) {
                    emit(client, ServerMessage::error("Already in queue"));
                }
                return;
            }
            ClientState::Active => {
                if let Some(client) = st.clients.get(&client_id) {
                    emit(client, ServerMessage::error("Session already active"));
                }
                return;
            }
            ClientState::Connected => {}
        }

        if let Some(Validation::Invalid(rejection)) = &validation {
            if let Some(client) = st.clients.get(&client_id) {
                emit(
                    client,
                    ServerMessage::InviteInvalid {
                        reason: rejection.as_str().to_string(),
                        message: rejection.message().to_string(),
                    },
                );
            }
            return;
        }

        if reconnect_eligible(&st, client_id, &invite_token) {
            self.complete_reconnect(&mut st, client_id, invite_token);
            return;
        }

        let slot_free = st.slot_free();
        if !slot_free && st.queue.len() >= self.config.max_queue_size {
            if let Some(client) = st.clients.get(&client_id) {
                emit(
                    client,
                    ServerMessage::QueueFull {
                        message: "The queue is currently full, please try again later".to_string(),
                    },
                );
            }
            return;
        }

        // Admission: mint the pending token first, in both paths.
        let now = Instant::now();
        let pending = token::mint(&client_id.to_string(), &self.config.session_secret);
        {
            let client = st
                .clients
                .get_mut(&client_id)
                .expect("presence checked above");
            client.invite_token = invite_token.clone();
            client.pending_session_token = Some(pending.clone());
            client.joined_at = Some(now);
        }
        st.pending_tokens.insert(
            pending.clone(),
            PendingToken {
                client_id,
                invite_token,
                source_addr,
                created_at: now,
            },
        );

        if slot_free {
            // Reserve the slot before any spawning so a concurrent join
            // observes an active session.
            let reserved = self.reserve_session(&mut st, client_id);
            drop(st);
            self.start_session_for(reserved).await;
        } else {
            st.queue.push_back(client_id);
            {
                let client = st
                    .clients
                    .get_mut(&client_id)
                    .expect("presence checked above");
                client.state = ClientState::Queued;
            }
            if let Some(client) = st.clients.get(&client_id) {
                emit(
                    client,
                    ServerMessage::SessionToken {
                        session_token: pending,
                    },
                );
            }
            self.broadcast_positions(&st);
            info!("client {} queued at position {}", client_id, st.queue.len());
        }
    }

    /// Handle leave_queue. A no-op (and no frame) for clients that are
    /// not queued.
    pub async fn handle_leave(&self, client_id: Uuid) {
        let mut st = self.state.lock().await;
        let Some(state) = st.clients.get(&client_id).map(|c| c.state) else {
            return;
        };
        if state != ClientState::Queued {
            return;
        }

        st.queue.retain(|id| *id != client_id);
        let pending = st.clients.get_mut(&client_id).and_then(|client| {
            client.state = ClientState::Connected;
            client.joined_at = None;
            client.invite_token = None;
            client.pending_session_token.take()
        });
        if let Some(tok) = pending {
            st.pending_tokens.remove(&tok);
        }
        if let Some(client) = st.clients.get(&client_id) {
            emit(client, ServerMessage::LeftQueue);
        }
        self.broadcast_positions(&st);
        info!("client {} left the queue", client_id);
    }

    /// Handle a closed connection. Queued clients are swept out of the
    /// queue; the active holder gets the reconnect grace window.
    pub async fn handle_disconnect(self: &Arc<Self>, client_id: Uuid) {
        let mut st = self.state.lock().await;
        let Some(client) = st.clients.remove(&client_id) else {
            return;
        };
        info!("client {} disconnected", client_id);

        match client.state {
            ClientState::Queued => {
                st.queue.retain(|id| *id != client_id);
                if let Some(tok) = &client.pending_session_token {
                    if let Some(pending) = st.pending_tokens.remove(tok) {
                        debug!(
                            "dropped pending token for {} after {:?} in queue",
                            client_id,
                            pending.created_at.elapsed()
                        );
                    }
                }
                self.broadcast_positions(&st);
            }
            ClientState::Active => {
                let Some(session) = st.active.as_mut().filter(|s| s.client_id == client_id)
                else {
                    return;
                };
                session.awaiting_reconnect = true;
                session.disconnected_at = Some(Instant::now());
                let session_id = session.session_id;
                info!(
                    "session {} holder disconnected, {}ms grace window open",
                    session_id,
                    self.config.disconnect_grace().as_millis()
                );

                let coord = Arc::clone(self);
                let grace = self.config.disconnect_grace();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    coord.end_if_still_awaiting(session_id).await;
                });
            }
            ClientState::Connected => {
                if let Some(tok) = &client.pending_session_token {
                    st.pending_tokens.remove(tok);
                }
            }
        }
    }

    /// Grace timer body: ends the session only if the same session is
    /// still awaiting a reconnect for at least the full window.
    async fn end_if_still_awaiting(self: &Arc<Self>, session_id: Uuid) {
        let expired = {
            let st = self.state.lock().await;
            st.active
                .as_ref()
                .filter(|s| s.session_id == session_id && s.awaiting_reconnect)
                .and_then(|s| s.disconnected_at)
                .map(|at| at.elapsed() >= self.config.disconnect_grace())
                .unwrap_or(false)
        };
        if expired {
            info!("session {} reconnect grace elapsed", session_id);
            self.end_session(Some(session_id), EndReason::Disconnected)
                .await;
        }
    }

    /// Reconnect takeover: hand the existing session to a new connection.
    fn complete_reconnect(&self, st: &mut CoreState, client_id: Uuid, invite_token: Option<String>) {
        if st.reconnect_in_progress {
            if let Some(client) = st.clients.get(&client_id) {
                emit(client, ServerMessage::error("Reconnect already in progress"));
            }
            return;
        }
        st.reconnect_in_progress = true;

        let (session_id, session_token, expires_at) = {
            let session = st
                .active
                .as_mut()
                .expect("reconnect eligibility requires an active session");
            session.client_id = client_id;
            session.awaiting_reconnect = false;
            session.disconnected_at = None;
            (
                session.session_id,
                session.session_token.clone(),
                session.expires_at,
            )
        };

        if let Some(client) = st.clients.get_mut(&client_id) {
            client.state = ClientState::Active;
            client.invite_token = invite_token;
            // The session token doubles as the pending token so auth
            // sub-requests keep succeeding under the same cookie.
            client.pending_session_token = Some(session_token.clone());
            emit(
                client,
                ServerMessage::SessionToken {
                    session_token: session_token.clone(),
                },
            );
            emit(
                client,
                ServerMessage::SessionStarting {
                    terminal_url: "/terminal".to_string(),
                    expires_at: expires_at.to_rfc3339(),
                    session_token,
                    reconnected: Some(true),
                },
            );
        }

        st.reconnect_in_progress = false;
        info!("client {} reconnected to session {}", client_id, session_id);
    }

    /// Reserve the active slot for a client. Runs entirely inside the
    /// caller's critical section.
    fn reserve_session(&self, st: &mut CoreState, client_id: Uuid) -> ReservedSession {
        let session_id = Uuid::new_v4();
        let now = Instant::now();
        let now_wall = Utc::now();

        let (queue_wait_ms, session_token, invite_token, source_addr, user_agent) = {
            let client = st
                .clients
                .get_mut(&client_id)
                .expect("reserved client is connected");
            client.state = ClientState::Active;
            let wait = client
                .joined_at
                .map(|at| at.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let token = client.pending_session_token.clone().unwrap_or_else(|| {
                token::mint(&session_id.to_string(), &self.config.session_secret)
            });
            (
                wait,
                token,
                client.invite_token.clone(),
                client.source_addr,
                client.user_agent.clone(),
            )
        };

        st.active = Some(ActiveSession {
            session_id,
            client_id,
            session_token,
            invite_token,
            source_addr,
            user_agent,
            started_at: now,
            started_at_wall: now_wall,
            expires_at: now_wall
                + ChronoDuration::seconds(self.config.session_timeout().as_secs() as i64),
            queue_wait_ms,
            kill_tx: None,
            env_file: None,
            awaiting_reconnect: false,
            disconnected_at: None,
            errors: Vec::new(),
        });
        self.metrics.set_session_active(true);

        ReservedSession {
            session_id,
            client_id,
        }
    }

    /// Drive a reserved slot to a running session; on spawn failure,
    /// advance down the queue until someone starts or it is empty.
    async fn start_session_for(self: &Arc<Self>, mut reserved: ReservedSession) {
        loop {
            if self.try_finish_start(&reserved).await {
                return;
            }
            let next = {
                let mut st = self.state.lock().await;
                if st.active.is_some() {
                    // Someone else took the slot while we were failing.
                    None
                } else {
                    self.next_live_head(&mut st)
                        .map(|cid| self.reserve_session(&mut st, cid))
                }
            };
            match next {
                Some(r) => reserved = r,
                None => return,
            }
        }
    }

    /// One spawn attempt. Returns false only when the attempt failed and
    /// the queue should be advanced.
    async fn try_finish_start(self: &Arc<Self>, reserved: &ReservedSession) -> bool {
        let span = tracing::info_span!("session.start");
        async move {
            let spawn_started = Instant::now();
            let spawn_result = supervisor::write_credential_file(&self.config, reserved.session_id)
                .and_then(|guard| {
                    supervisor::spawn_terminal(&self.config, reserved.session_id)
                        .map(|spawned| (guard, spawned))
                });

            let mut st = self.state.lock().await;
            let still_current = st
                .active
                .as_ref()
                .map(|s| s.session_id == reserved.session_id)
                .unwrap_or(false);

            match spawn_result {
                Ok((guard, spawned)) => {
                    if !still_current {
                        // Torn down mid-spawn (shutdown). Dropping the child
                        // kills it; dropping the guard removes the file.
                        debug!("session {} gone during spawn, reaping", reserved.session_id);
                        drop(spawned);
                        drop(guard);
                        return true;
                    }
                    self.metrics
                        .observe_spawn(spawn_started.elapsed().as_secs_f64());
                    self.finalize_start(&mut st, reserved, guard, spawned);
                    true
                }
                Err(e) => {
                    warn!("session start failed: {}", e);
                    if still_current {
                        st.active = None;
                        self.metrics.set_session_active(false);
                    }
                    let pending = st.clients.get_mut(&reserved.client_id).and_then(|client| {
                        client.state = ClientState::Connected;
                        client.joined_at = None;
                        client.invite_token = None;
                        client.pending_session_token.take()
                    });
                    if let Some(tok) = pending {
                        st.pending_tokens.remove(&tok);
                    }
                    if let Some(client) = st.clients.get(&reserved.client_id) {
                        emit(
                            client,
                            ServerMessage::error(format!("Failed to start session: {}", e)),
                        );
                    }
                    false
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Wire up a successfully spawned session: token transfer, timers,
    /// exit watcher, persistence, and the frames to the promoted client.
    fn finalize_start(
        self: &Arc<Self>,
        st: &mut CoreState,
        reserved: &ReservedSession,
        guard: EnvFileGuard,
        spawned: SpawnedTerminal,
    ) {
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let record;
        let session_token;
        let expires_at;
        let client_id;
        let queue_wait_ms;
        {
            let session = st.active.as_mut().expect("current session checked");
            session.env_file = Some(guard);
            session.kill_tx = Some(kill_tx.clone());
            session_token = session.session_token.clone();
            expires_at = session.expires_at;
            client_id = session.client_id;
            queue_wait_ms = session.queue_wait_ms;
            record = SessionRecord {
                session_id: session.session_id,
                started_at: session.started_at_wall,
                expires_at: session.expires_at,
                invite_token: session.invite_token.clone(),
                source_address: session.source_addr.to_string(),
                user_agent: session.user_agent.clone(),
                queue_wait_ms,
            };
        }
        self.metrics.observe_queue_wait(queue_wait_ms as f64 / 1000.0);

        // The pending token becomes the session token under the same key.
        st.pending_tokens.remove(&session_token);
        st.session_tokens
            .insert(session_token.clone(), reserved.session_id);

        self.arm_session_timers(reserved.session_id, kill_tx);

        let coord = Arc::clone(self);
        let session_id = reserved.session_id;
        let child = spawned.child;
        tokio::spawn(async move {
            let status = supervisor::supervise(child, kill_rx).await;
            info!(
                "terminal subprocess for session {} exited: {:?}",
                session_id, status
            );
            coord
                .end_session(Some(session_id), EndReason::ContainerExit)
                .await;
        });

        // Best-effort persistence; never read back by the coordinator.
        let store = Arc::clone(&self.store);
        let key = session_key(client_id);
        let ttl = self.config.session_timeout().as_secs();
        tokio::spawn(async move {
            match serde_json::to_string(&record) {
                Ok(json) => {
                    if let Err(e) = store.set_ex(&key, &json, ttl).await {
                        warn!("session persistence write failed: {}", e);
                    }
                }
                Err(e) => warn!("session persistence encode failed: {}", e),
            }
        });

        if let Some(client) = st.clients.get(&client_id) {
            emit(
                client,
                ServerMessage::SessionToken {
                    session_token: session_token.clone(),
                },
            );
            emit(
                client,
                ServerMessage::SessionStarting {
                    terminal_url: "/terminal".to_string(),
                    expires_at: expires_at.to_rfc3339(),
                    session_token,
                    reconnected: None,
                },
            );
        }
        self.metrics.inc_sessions_started();
        info!(
            "session {} started for client {} (queue wait {} ms)",
            reserved.session_id, client_id, queue_wait_ms
        );
    }

    /// Warning, soft-timeout and hard-kill timers. Each re-checks the
    /// session identity on fire and no-ops on mismatch, which replaces
    /// per-timer cancellation.
    fn arm_session_timers(self: &Arc<Self>, session_id: Uuid, kill_tx: UnboundedSender<KillSignal>) {
        let coord = Arc::clone(self);
        let warn_after = self.config.warning_offset();
        tokio::spawn(async move {
            tokio::time::sleep(warn_after).await;
            let st = coord.state.lock().await;
            if let Some(session) = st.active.as_ref().filter(|s| s.session_id == session_id) {
                if let Some(client) = st.clients.get(&session.client_id) {
                    emit(
                        client,
                        ServerMessage::SessionWarning {
                            minutes_remaining: WARNING_BEFORE_TIMEOUT_MINUTES as u32,
                        },
                    );
                }
            }
        });

        let coord = Arc::clone(self);
        let timeout_after = self.config.session_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout_after).await;
            coord.end_session(Some(session_id), EndReason::Timeout).await;
        });

        let coord = Arc::clone(self);
        let hard_after = self.config.hard_kill_offset();
        tokio::spawn(async move {
            tokio::time::sleep(hard_after).await;
            let still_current = {
                let st = coord.state.lock().await;
                st.active
                    .as_ref()
                    .map(|s| s.session_id == session_id)
                    .unwrap_or(false)
            };
            if still_current {
                warn!("session {} still alive past hard timeout", session_id);
                let _ = kill_tx.send(KillSignal::Hard);
            }
        });
    }

    /// End the active session. `expected` carries the session identity
    /// for timer and exit paths; a mismatch means the timer is stale and
    /// the call is a no-op.
    pub async fn end_session(self: &Arc<Self>, expected: Option<Uuid>, reason: EndReason) {
        let span = tracing::info_span!("session.end");
        async move {
            let ended = {
                let mut st = self.state.lock().await;
                let matches = st
                    .active
                    .as_ref()
                    .map(|s| expected.map_or(true, |sid| s.session_id == sid))
                    .unwrap_or(false);
                if !matches {
                    return;
                }
                let session = st.active.take().expect("matched above");
                self.metrics.set_session_active(false);

                let duration = session.started_at.elapsed();
                self.metrics
                    .observe_session_duration(reason.as_str(), duration.as_secs_f64());
                self.metrics.inc_sessions_ended(reason.as_str());

                st.session_tokens.remove(&session.session_token);

                if let Some(client) = st.clients.get_mut(&session.client_id) {
                    client.state = ClientState::Connected;
                    client.joined_at = None;
                    client.invite_token = None;
                    client.pending_session_token = None;
                    emit(client, ServerMessage::session_ended(reason));
                }

                info!(
                    "session {} ended: reason={}, duration={}s",
                    session.session_id,
                    reason.as_str(),
                    duration.as_secs()
                );
                session
            };

            // Outside the lock: soft kill, credential file, audit,
            // persistence cleanup.
            if let Some(kill_tx) = &ended.kill_tx {
                let _ = kill_tx.send(KillSignal::Soft);
            }
            drop(ended.env_file);

            if let Some(invite_token) = &ended.invite_token {
                let entry = SessionAudit {
                    session_id: ended.session_id,
                    client_id: ended.client_id,
                    started_at: ended.started_at_wall,
                    ended_at: Utc::now(),
                    end_reason: reason.as_str().to_string(),
                    queue_wait_ms: ended.queue_wait_ms,
                    source_address: ended.source_addr.to_string(),
                    user_agent: ended.user_agent.clone(),
                    errors: ended.errors.clone(),
                };
                invite::record_session_audit(self.store.as_ref(), invite_token, entry).await;
            }

            if let Err(e) = self.store.del(&session_key(ended.client_id)).await {
                debug!("session persistence delete failed: {}", e);
            }

            self.promote().await;
        }
        .instrument(span)
        .await
    }

    /// Advance the queue into the free slot
    async fn promote(self: &Arc<Self>) {
        let reserved = {
            let mut st = self.state.lock().await;
            if st.active.is_some() {
                return;
            }
            self.next_live_head(&mut st)
                .map(|cid| self.reserve_session(&mut st, cid))
        };
        if let Some(reserved) = reserved {
            self.start_session_for(reserved).await;
        }
    }

    /// Pop queue entries until a live queued client surfaces. Departed
    /// entries are discarded without shifting anyone else's order.
    fn next_live_head(&self, st: &mut CoreState) -> Option<Uuid> {
        let mut head = None;
        while let Some(id) = st.queue.pop_front() {
            if st
                .clients
                .get(&id)
                .map(|c| c.state == ClientState::Queued)
                .unwrap_or(false)
            {
                head = Some(id);
                break;
            }
            debug!("discarding departed queue entry {}", id);
        }
        self.broadcast_positions(st);
        head
    }

    fn broadcast_positions(&self, st: &CoreState) {
        let queue_size = st.queue.len();
        for (index, id) in st.queue.iter().enumerate() {
            if let Some(client) = st.clients.get(id) {
                emit(
                    client,
                    ServerMessage::QueuePosition {
                        position: index + 1,
                        queue_size,
                        estimated_wait: estimated_wait(index + 1, AVERAGE_SESSION_MINUTES),
                    },
                );
            }
        }
        self.metrics.set_queue_size(queue_size);
    }

    /// Auth sub-request: is this bearer token a live session or a queued
    /// client? Stale session-map entries are evicted on sight.
    pub async fn authorize_session_token(&self, token: &str) -> SessionAuth {
        let mut st = self.state.lock().await;
        if let Some(session_id) = st.session_tokens.get(token).copied() {
            let current = st
                .active
                .as_ref()
                .map(|s| s.session_id == session_id)
                .unwrap_or(false);
            if current {
                return SessionAuth::Active {
                    principal: principal_for(session_id),
                };
            }
            st.session_tokens.remove(token);
            return SessionAuth::Invalid;
        }
        if let Some(pending) = st.pending_tokens.get(token) {
            return SessionAuth::Pending {
                principal: principal_for(pending.client_id),
            };
        }
        SessionAuth::Invalid
    }

    /// Invite sub-request: same decision as a join, without side effects.
    pub async fn validate_invite_readonly(&self, token: &str, source_addr: IpAddr) -> Validation {
        let ctx = {
            let st = self.state.lock().await;
            rejoin_context(&st)
        };
        invite::validate(
            self.store.as_ref(),
            token,
            source_addr,
            &ctx,
            &self.metrics,
            false,
        )
        .await
    }

    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let st = self.state.lock().await;
        let queue_size = st.queue.len();
        StatusSnapshot {
            queue_size,
            session_active: st.active.is_some(),
            estimated_wait: estimated_wait(queue_size, AVERAGE_SESSION_MINUTES),
            max_queue_size: self.config.max_queue_size,
        }
    }

    /// Graceful shutdown: end the active session before the listener goes
    /// away.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("coordinator shutting down");
        self.end_session(None, EndReason::Shutdown).await;
    }
}

fn rejoin_context(st: &CoreState) -> RejoinContext {
    RejoinContext {
        active: st.active.as_ref().and_then(|s| {
            s.invite_token
                .as_ref()
                .map(|tok| (tok.clone(), s.source_addr))
        }),
        pending: st
            .pending_tokens
            .values()
            .filter_map(|p| p.invite_token.as_ref().map(|tok| (tok.clone(), p.source_addr)))
            .collect(),
    }
}

fn reconnect_eligible(st: &CoreState, client_id: Uuid, invite_token: &Option<String>) -> bool {
    let Some(session) = st.active.as_ref() else {
        return false;
    };
    let Some(client) = st.clients.get(&client_id) else {
        return false;
    };
    session.awaiting_reconnect
        && session.invite_token == *invite_token
        && session.source_addr == client.source_addr
}
