//! Deduplication shared across processes through a [`KeyValueStore`].
//!
//! Entries are stored as JSON under `triage:dedup:{key}` with the entry
//! TTL. Every check runs under a short-lived lock taken with
//! `set_if_absent` on `triage:dedup-lock:{key}`: the read, the update of
//! `occurrence_count` and the write happen while the lock is held, so
//! two processes racing on the same key neither start two executions nor
//! lose an occurrence. A caller that cannot get the lock within the lock
//! wait gets `Skip` (nothing recorded yet) or the current entry.
//!
//! Each store call is retried with the configured [`RetryPolicy`]. A call
//! that still fails fails open: the event is treated as new so triage is
//! never blocked by the cache. This can produce a duplicate execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::kv::{KeyValueStore, KvError, KvResult};
use super::{DedupDecision, DeduplicationEntry, Deduplicator, EventFingerprint, DEFAULT_TTL_SECS};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

const ENTRY_PREFIX: &str = "triage:dedup:";
const LOCK_PREFIX: &str = "triage:dedup-lock:";

/// Default lock lifetime; bounds how long a crashed holder blocks a key.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;

/// Default time a check waits for a held lock before giving up.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 2_000;

/// Pause between lock attempts.
const LOCK_POLL: Duration = Duration::from_millis(10);

fn entry_key(key: &str) -> String {
    format!("{ENTRY_PREFIX}{key}")
}

fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

/// Deduplicator backed by a shared store.
pub struct DistributedDeduplicator {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    lock_ttl: Duration,
    lock_wait: Duration,
    retry: RetryPolicy,
}

impl DistributedDeduplicator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        ttl: Duration,
        lock_ttl: Duration,
    ) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::Invalid {
                name: "dedup.ttl_secs",
                reason: "must be non-zero".to_string(),
            });
        }
        if lock_ttl.is_zero() {
            return Err(ConfigError::Invalid {
                name: "dedup.lock_ttl_secs",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(Self {
            store,
            ttl,
            lock_ttl,
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            retry: RetryPolicy::default(),
        })
    }

    /// Defaults: 30 minute entries, 30 second locks, 2 second lock wait,
    /// default retry policy.
    pub fn with_defaults(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy applied to every store call.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Result<Self, ConfigError> {
        retry.validate()?;
        self.retry = retry;
        Ok(self)
    }

    /// How long a check waits for a lock held elsewhere.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn read_entry(&self, key: &str) -> KvResult<Option<DeduplicationEntry>> {
        let store_key = entry_key(key);
        let Some(raw) = self
            .retry
            .run("dedup.get", || self.store.get(&store_key))
            .await?
        else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KvError::Deserialization {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn write_entry(&self, entry: &DeduplicationEntry) -> KvResult<()> {
        let raw = serde_json::to_string(entry).map_err(|e| KvError::Serialization {
            key: entry.key.clone(),
            reason: e.to_string(),
        })?;
        let store_key = entry_key(&entry.key);
        self.retry
            .run("dedup.set", || {
                self.store.set_with_ttl(&store_key, raw.clone(), self.ttl)
            })
            .await
    }

    /// Take the lock for `key`, waiting up to the lock wait. Returns the
    /// token it was taken with, or `None` if it stayed held elsewhere.
    async fn acquire(&self, key: &str) -> KvResult<Option<String>> {
        let lock = lock_key(key);
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.lock_wait;

        loop {
            let acquired = self
                .retry
                .run("dedup.lock", || {
                    self.store.set_if_absent(&lock, token.clone(), self.lock_ttl)
                })
                .await?;
            if acquired {
                return Ok(Some(token));
            }

            // A retried attempt may have landed before reporting an error.
            let holder = self
                .retry
                .run("dedup.get", || self.store.get(&lock))
                .await?;
            if holder.as_deref() == Some(token.as_str()) {
                return Ok(Some(token));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    /// Read, update and write the entry. Caller holds the lock.
    async fn check_locked(&self, key: &str) -> KvResult<DedupDecision> {
        match self.read_entry(key).await? {
            Some(mut entry) => {
                entry.touch();
                self.write_entry(&entry).await?;
                debug!(
                    key,
                    execution_id = %entry.execution_id,
                    occurrences = entry.occurrence_count,
                    "Duplicate event"
                );
                Ok(DedupDecision::duplicate(&entry))
            }
            None => {
                let entry = DeduplicationEntry::new(key, self.ttl.as_secs());
                self.write_entry(&entry).await?;
                Ok(DedupDecision::new_execution(key.to_string(), entry.execution_id))
            }
        }
    }

    async fn try_check(&self, key: &str) -> KvResult<DedupDecision> {
        let Some(token) = self.acquire(key).await? else {
            return match self.read_entry(key).await? {
                Some(entry) => {
                    warn!(
                        key,
                        execution_id = %entry.execution_id,
                        "Dedup lock contended, occurrence not counted"
                    );
                    Ok(DedupDecision::duplicate(&entry))
                }
                None => {
                    debug!(key, "Dedup lock held elsewhere, skipping");
                    Ok(DedupDecision::skip(key.to_string()))
                }
            };
        };

        let decision = self.check_locked(key).await;
        self.release_held(key, &token).await;
        decision
    }

    /// Delete the lock only if it still carries `token`.
    async fn release_held(&self, key: &str, token: &str) {
        let lock = lock_key(key);
        match self.retry.run("dedup.get", || self.store.get(&lock)).await {
            Ok(Some(holder)) if holder == token => self.release(key).await,
            Ok(_) => debug!(key, "Dedup lock expired before release"),
            Err(e) => warn!(key, error = %e, "Failed to read dedup lock before release"),
        }
    }

    /// Delete the lock for `key` regardless of holder. Best effort: an
    /// unreleased lock expires on its own after the lock TTL.
    pub async fn release(&self, key: &str) {
        let lock = lock_key(key);
        if let Err(e) = self
            .retry
            .run("dedup.delete", || self.store.delete(&lock))
            .await
        {
            warn!(key, error = %e, "Failed to release dedup lock");
        }
    }
}

impl std::fmt::Debug for DistributedDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedDeduplicator")
            .field("ttl", &self.ttl)
            .field("lock_ttl", &self.lock_ttl)
            .field("lock_wait", &self.lock_wait)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Deduplicator for DistributedDeduplicator {
    async fn check(&self, fingerprint: &EventFingerprint) -> DedupDecision {
        let key = fingerprint.key();
        match self.try_check(&key).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(key = %key, error = %e, "Dedup store failed, treating event as new");
                DedupDecision::new_execution(key, uuid::Uuid::new_v4().to_string())
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<DeduplicationEntry> {
        match self.read_entry(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Dedup lookup failed");
                None
            }
        }
    }

    async fn forget(&self, key: &str) {
        let store_key = entry_key(key);
        match self
            .retry
            .run("dedup.delete", || self.store.delete(&store_key))
            .await
        {
            Ok(()) => debug!(key, "Dedup entry forgotten"),
            Err(e) => warn!(key, error = %e, "Failed to forget dedup entry"),
        }
    }

    fn backend(&self) -> &'static str {
        "distributed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::kv::InMemoryKvStore;
    use crate::dedup::DedupAction;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct DownStore;

    #[async_trait]
    impl KeyValueStore for DownStore {
        async fn get(&self, _key: &str) -> KvResult<Option<String>> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn set_with_ttl(&self, _key: &str, _value: String, _ttl: Duration) -> KvResult<()> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn set_if_absent(&self, _key: &str, _value: String, _ttl: Duration) -> KvResult<bool> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> KvResult<()> {
            Err(KvError::Unavailable("connection refused".into()))
        }
    }

    /// Fails the next `blips` calls with a transient error, then delegates.
    #[derive(Default)]
    struct BlinkingStore {
        inner: InMemoryKvStore,
        blips: AtomicU32,
        failed: AtomicU32,
    }

    impl BlinkingStore {
        fn blink(&self) -> KvResult<()> {
            let pending = self
                .blips
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if pending.is_ok() {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return Err(KvError::Timeout(Duration::from_millis(250)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStore for BlinkingStore {
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            self.blink()?;
            self.inner.get(key).await
        }
        async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> KvResult<()> {
            self.blink()?;
            self.inner.set_with_ttl(key, value, ttl).await
        }
        async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> KvResult<bool> {
            self.blink()?;
            self.inner.set_if_absent(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> KvResult<()> {
            self.blink()?;
            self.inner.delete(key).await
        }
    }

    fn fp() -> EventFingerprint {
        EventFingerprint::new("rule-7").with_source_system("prometheus")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10), 2.0).unwrap()
    }

    #[tokio::test]
    async fn test_shared_store_dedups_across_instances() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let node_a = DistributedDeduplicator::with_defaults(store.clone());
        let node_b = DistributedDeduplicator::with_defaults(store.clone());

        let first = node_a.check(&fp()).await;
        assert_eq!(first.action, DedupAction::New);

        let second = node_b.check(&fp()).await;
        assert_eq!(second.action, DedupAction::UpdateExisting);
        assert_eq!(second.execution_id, first.execution_id);
        assert_eq!(second.occurrence_count, 2);

        let entry = node_a.lookup(&fp().key()).await.unwrap();
        assert_eq!(entry.occurrence_count, 2);
    }

    #[tokio::test]
    async fn test_lock_released_after_each_check() {
        let store = Arc::new(InMemoryKvStore::new());
        let dedup = DistributedDeduplicator::with_defaults(store.clone());
        dedup.check(&fp()).await;
        assert_eq!(store.get(&lock_key(&fp().key())).await.unwrap(), None);
        dedup.check(&fp()).await;
        assert_eq!(store.get(&lock_key(&fp().key())).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_without_entry_skips() {
        let store = Arc::new(InMemoryKvStore::new());
        let dedup = DistributedDeduplicator::with_defaults(store.clone());
        store
            .set_if_absent(&lock_key(&fp().key()), "other".into(), Duration::from_secs(30))
            .await
            .unwrap();

        let started = Instant::now();
        let decision = dedup.check(&fp()).await;
        assert_eq!(decision.action, DedupAction::Skip);
        assert!(decision.execution_id.is_none());
        assert!(started.elapsed() >= Duration::from_millis(DEFAULT_LOCK_WAIT_MS));
        // the foreign lock is left alone
        assert_eq!(
            store.get(&lock_key(&fp().key())).await.unwrap().as_deref(),
            Some("other")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_with_entry_returns_current_entry() {
        let store = Arc::new(InMemoryKvStore::new());
        let dedup = DistributedDeduplicator::with_defaults(store.clone())
            .with_lock_wait(Duration::from_millis(100));
        let first = dedup.check(&fp()).await;
        store
            .set_if_absent(&lock_key(&fp().key()), "other".into(), Duration::from_secs(30))
            .await
            .unwrap();

        let decision = dedup.check(&fp()).await;
        assert_eq!(decision.action, DedupAction::UpdateExisting);
        assert_eq!(decision.execution_id, first.execution_id);
        assert_eq!(decision.occurrence_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lock_expires() {
        let store = Arc::new(InMemoryKvStore::new());
        let dedup = DistributedDeduplicator::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(5),
        )
        .unwrap();
        store
            .set_if_absent(&lock_key(&fp().key()), "crashed".into(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(dedup.check(&fp()).await.action, DedupAction::Skip);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(dedup.check(&fp()).await.action, DedupAction::New);
    }

    #[tokio::test]
    async fn test_concurrent_first_occurrence_yields_one_new() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let dedup = Arc::new(DistributedDeduplicator::with_defaults(store));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                tokio::spawn(async move { dedup.check(&fp()).await })
            })
            .collect();

        let mut new_count = 0;
        for handle in handles {
            if handle.await.unwrap().action == DedupAction::New {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried() {
        let store = Arc::new(BlinkingStore::default());
        let dedup = DistributedDeduplicator::with_defaults(store.clone())
            .with_retry(fast_retry())
            .unwrap();

        let first = dedup.check(&fp()).await;
        store.blips.store(1, Ordering::SeqCst);
        let second = dedup.check(&fp()).await;

        assert_eq!(store.failed.load(Ordering::SeqCst), 1);
        assert_eq!(second.action, DedupAction::UpdateExisting);
        assert_eq!(second.execution_id, first.execution_id);
        assert_eq!(second.occurrence_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_fails_open() {
        let dedup = DistributedDeduplicator::with_defaults(Arc::new(DownStore));
        let a = dedup.check(&fp()).await;
        let b = dedup.check(&fp()).await;
        assert_eq!(a.action, DedupAction::New);
        assert_eq!(b.action, DedupAction::New);
        assert_ne!(a.execution_id, b.execution_id);
        assert!(dedup.lookup(&fp().key()).await.is_none());
    }

    #[tokio::test]
    async fn test_forget_drops_entry() {
        let store = Arc::new(InMemoryKvStore::new());
        let dedup = DistributedDeduplicator::with_defaults(store.clone());
        let first = dedup.check(&fp()).await;
        dedup.forget(&first.key).await;

        assert!(dedup.lookup(&first.key).await.is_none());
        let again = dedup.check(&fp()).await;
        assert_eq!(again.action, DedupAction::New);
        assert_ne!(again.execution_id, first.execution_id);
    }

    #[test]
    fn test_construction_validation() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        assert!(DistributedDeduplicator::new(store.clone(), Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(DistributedDeduplicator::new(store.clone(), Duration::from_secs(1), Duration::ZERO).is_err());
        let bad_retry = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(DistributedDeduplicator::with_defaults(store).with_retry(bad_retry).is_err());
    }
}
