//! Demo coordinator library
//!
//! Multiplexes one shared web terminal across many remote users: a FIFO
//! queue feeds a single active session gated by single-use invite tokens,
//! with bearer tokens for the reverse proxy's auth sub-requests.

pub mod config;
pub mod coordinator;
pub mod http;
pub mod invite;
pub mod protocol;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod token;

// Re-exports for convenience
pub use config::Config;
pub use coordinator::{Coordinator, SessionAuth, StatusSnapshot};
pub use protocol::{ClientMessage, EndReason, ServerMessage};
pub use store::{KeyValueStore, RedisStore, StoreError};
pub use telemetry::Metrics;
