//! Shared key-value store used by the distributed deduplicator.
//!
//! The trait is the minimal surface a networked cache has to offer:
//! get, set with expiry, atomic set-if-absent, delete. [`InMemoryKvStore`]
//! implements it in-process so several deduplicator instances can share
//! one store in tests and single-node deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::retry::Transient;

/// Errors from the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("key-value store timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode value for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("failed to decode value for {key}: {reason}")]
    Deserialization { key: String, reason: String },
}

impl Transient for KvError {
    fn is_transient(&self) -> bool {
        matches!(self, KvError::Unavailable(_) | KvError::Timeout(_))
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Minimal async key-value store with expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Unconditional write with a time-to-live.
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> KvResult<()>;

    /// Write only if the key is absent (or expired). Returns whether the
    /// write happened. Must be atomic.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> KvResult<bool>;

    async fn delete(&self, key: &str) -> KvResult<()>;
}

/// In-process [`KeyValueStore`] with lazy expiry.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    values: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys currently held.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.values
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let now = Instant::now();
        let mut values = self.values.lock().await;
        match values.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> KvResult<()> {
        let expires_at = Instant::now() + ttl;
        self.values
            .lock()
            .await
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> KvResult<bool> {
        let now = Instant::now();
        let mut values = self.values.lock().await;
        if let Some((_, expires_at)) = values.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        values.insert(key.to_string(), (value, now + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}
