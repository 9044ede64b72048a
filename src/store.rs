//! Demo coordinator - key-value store adapter
//!
//! Thin semantic wrapper around the external store. The coordinator only
//! needs GET/SET/DEL/TTL with per-key TTL; everything stored is a JSON
//! string. Invite records and the best-effort session persistence records
//! both live behind this trait.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// TTL sentinel: key does not exist
pub const TTL_MISSING: i64 = -2;
/// TTL sentinel: key exists but carries no expiry
pub const TTL_NONE: i64 = -1;

/// Store-level errors
#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Serialize(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "store backend error: {}", e),
            Self::Serialize(e) => write!(f, "store serialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}

/// The store operations the coordinator depends on
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// SET with a TTL in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Remaining TTL in seconds, or one of the sentinels above
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;
}

/// Redis-backed store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and wrap the connection in a reconnecting manager
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(ttl)
    }
}

/// In-memory store used by unit tests. TTLs are recorded, not enforced.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        entries: Mutex<HashMap<String, (String, Option<u64>)>>,
        failing: AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent operation fail, to exercise fail-closed paths
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn insert(&self, key: &str, value: &str, ttl_secs: Option<u64>) {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), (value.to_string(), ttl_secs));
        }

        pub fn raw(&self, key: &str) -> Option<String> {
            self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone())
        }

        pub fn recorded_ttl(&self, key: &str) -> Option<u64> {
            self.entries.lock().unwrap().get(key).and_then(|(_, t)| *t)
        }

        pub fn contains(&self, key: &str) -> bool {
            self.entries.lock().unwrap().contains_key(key)
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Backend("injected failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for MemoryStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.check()?;
            Ok(self.raw(key))
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
            self.check()?;
            self.insert(key, value, Some(ttl_secs));
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
            self.check()?;
            let entries = self.entries.lock().unwrap();
            Ok(match entries.get(key) {
                None => TTL_MISSING,
                Some((_, None)) => TTL_NONE,
                Some((_, Some(t))) => *t as i64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 60).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl("k").await.unwrap(), 60);

        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), TTL_MISSING);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failure() {
        let store = MemoryStore::new();
        store.set_failing(true);

        assert!(store.get("k").await.is_err());
        assert!(store.set_ex("k", "v", 1).await.is_err());
    }
}
