//! In-process deduplicator with TTL expiry and bounded capacity.
//!
//! Entries live in a [`DashMap`]; each check-and-record runs inside the
//! map's entry guard for that key, so it is atomic per key while other
//! keys proceed in parallel. When the map grows past capacity, expired
//! entries are dropped first, then the entry with the oldest `last_seen`.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    DedupDecision, DeduplicationEntry, Deduplicator, EventFingerprint, DEFAULT_CAPACITY,
    DEFAULT_TTL_SECS,
};
use crate::error::ConfigError;

#[derive(Debug, Clone)]
struct Slot {
    entry: DeduplicationEntry,
    expires_at: Instant,
    last_touched: Instant,
}

/// Local (single-process) deduplicator.
#[derive(Debug)]
pub struct LocalDeduplicator {
    entries: DashMap<String, Slot>,
    ttl: Duration,
    capacity: usize,
}

impl LocalDeduplicator {
    /// Create a deduplicator. TTL and capacity must be non-zero.
    pub fn new(ttl: Duration, capacity: usize) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::Invalid {
                name: "dedup.ttl_secs",
                reason: "must be non-zero".to_string(),
            });
        }
        if capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "dedup.capacity",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(Self {
            entries: DashMap::new(),
            ttl,
            capacity,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn fresh_slot(&self, key: &str, now: Instant) -> (Slot, DedupDecision) {
        let entry = DeduplicationEntry::new(key, self.ttl.as_secs());
        let decision = DedupDecision::new_execution(key.to_string(), entry.execution_id.clone());
        let slot = Slot {
            entry,
            expires_at: now + self.ttl,
            last_touched: now,
        };
        (slot, decision)
    }

    /// Check and record one occurrence of `key`.
    pub fn check_key(&self, key: &str) -> DedupDecision {
        let now = Instant::now();

        let decision = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.expires_at > now {
                    slot.entry.touch();
                    slot.expires_at = now + self.ttl;
                    slot.last_touched = now;
                    debug!(
                        key,
                        execution_id = %slot.entry.execution_id,
                        occurrences = slot.entry.occurrence_count,
                        "Duplicate event"
                    );
                    return DedupDecision::duplicate(&slot.entry);
                }
                debug!(key, "Dedup entry expired");
                let (slot, decision) = self.fresh_slot(key, now);
                occupied.insert(slot);
                decision
            }
            Entry::Vacant(vacant) => {
                let (slot, decision) = self.fresh_slot(key, now);
                vacant.insert(slot);
                decision
            }
        };

        // The entry guard is released here; eviction walks every shard.
        if self.entries.len() > self.capacity {
            self.evict(now, key);
        }

        decision
    }

    /// Drop expired entries first; if still over capacity, drop the entry
    /// with the oldest `last_seen` (never the one just inserted).
    fn evict(&self, now: Instant, keep: &str) {
        let before = self.entries.len();
        self.entries.retain(|k, slot| k == keep || slot.expires_at > now);
        let after = self.entries.len();
        if after < before {
            debug!(evicted = before - after, "Evicted expired dedup entries");
        }
        if after <= self.capacity {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .filter(|slot| slot.key() != keep)
            .min_by_key(|slot| slot.value().last_touched)
            .map(|slot| slot.key().clone());
        if let Some(oldest) = oldest {
            info!(key = %oldest, "Dedup capacity reached, evicting least recently seen entry");
            self.entries.remove(&oldest);
        }
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Live entry for `key`.
    pub fn get(&self, key: &str) -> Option<DeduplicationEntry> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.entry.clone())
    }

    /// Remove the entry for `key`, live or not.
    pub fn remove(&self, key: &str) -> Option<DeduplicationEntry> {
        self.entries.remove(key).map(|(_, slot)| slot.entry)
    }

    /// Number of stored entries (including not-yet-purged expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalDeduplicator {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[async_trait]
impl Deduplicator for LocalDeduplicator {
    async fn check(&self, fingerprint: &EventFingerprint) -> DedupDecision {
        self.check_key(&fingerprint.key())
    }

    async fn lookup(&self, key: &str) -> Option<DeduplicationEntry> {
        self.get(key)
    }

    async fn forget(&self, key: &str) {
        if self.remove(key).is_some() {
            debug!(key, "Dedup entry forgotten");
        }
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
