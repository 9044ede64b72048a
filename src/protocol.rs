//! Demo coordinator - client protocol types
//!
//! Defines the framed JSON protocol between the landing page and the
//! coordinator. Every frame carries a `type` tag.

use serde::{Deserialize, Serialize};

/// Messages sent from client to server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask to join the queue (or take the free slot), optionally with an invite
    JoinQueue {
        #[serde(rename = "inviteToken")]
        invite_token: Option<String>,
    },
    /// Leave the queue; a no-op for clients that are not queued
    LeaveQueue,
    /// Keepalive
    Heartbeat,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Snapshot sent immediately on connect
    Status {
        queue_size: usize,
        session_active: bool,
    },
    /// Position update for a queued client
    QueuePosition {
        position: usize,
        queue_size: usize,
        estimated_wait: String,
    },
    /// Join rejected because the queue is at its bound
    QueueFull { message: String },
    /// Acknowledges a leave_queue from a queued client
    LeftQueue,
    /// Bearer token for the auth sub-request path; issued at queue entry
    /// (pending) and again at session start (promoted)
    SessionToken { session_token: String },
    /// The client now holds the active slot
    SessionStarting {
        terminal_url: String,
        expires_at: String,
        session_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reconnected: Option<bool>,
    },
    /// Emitted five minutes before the soft timeout
    SessionWarning { minutes_remaining: u32 },
    /// The active session is over; the client must drop its cookie
    SessionEnded {
        reason: EndReason,
        clear_session_cookie: bool,
    },
    /// Invite validation failed; not an error, a first-class outcome
    InviteInvalid { reason: String, message: String },
    /// Keepalive response
    HeartbeatAck,
    /// Protocol-level error surfaced to this client only
    Error { message: String },
}

/// Why a session ended. Doubles as the `reason` label on session metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Timeout,
    ContainerExit,
    Disconnected,
    Shutdown,
    UserEnded,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ContainerExit => "container_exit",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
            Self::UserEnded => "user_ended",
            Self::Error => "error",
        }
    }
}

impl ServerMessage {
    /// Create an error frame
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Create a session_ended frame; the cookie is always cleared
    pub fn session_ended(reason: EndReason) -> Self {
        Self::SessionEnded {
            reason,
            clear_session_cookie: true,
        }
    }
}

/// Render an estimated wait as the protocol's `"N minutes"` string
pub fn estimated_wait(position: usize, average_session_minutes: u64) -> String {
    format!("{} minutes", position as u64 * average_session_minutes)
}
