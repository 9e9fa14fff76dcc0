//! Deduplication engine — maps repeated source events onto one execution
//!
//! ```text
//! AlertEvent ──► EventFingerprint ──► key = blake3(fields)
//!                                       │
//!            ┌──────────────────────────┴───────────────────────┐
//!            ▼                                                  ▼
//!   LocalDeduplicator                               DistributedDeduplicator
//!   DashMap entry per key, TTL,                     KeyValueStore + set-if-absent lock,
//!   LRU-style eviction                              retried, fails open to `New`
//! ```
//!
//! Both variants implement [`Deduplicator`] and are chosen at construction.

pub mod distributed;
pub mod key;
pub mod kv;
pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use distributed::DistributedDeduplicator;
pub use key::EventFingerprint;
pub use kv::{InMemoryKvStore, KeyValueStore, KvError};
pub use local::LocalDeduplicator;

/// Default time-to-live of a dedup entry (30 minutes).
pub const DEFAULT_TTL_SECS: u64 = 30 * 60;

/// Default capacity of the local variant.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// What the caller should do with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupAction {
    /// First occurrence: start a new round
    New,
    /// Repeat: update the existing execution
    UpdateExisting,
    /// Another process is starting this round right now
    Skip,
}

impl std::fmt::Display for DedupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::UpdateExisting => write!(f, "update_existing"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// Result of a dedup check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupDecision {
    pub action: DedupAction,
    /// Fingerprint key
    pub key: String,
    /// New execution id for `New`, the original one for `UpdateExisting`,
    /// none for `Skip`
    pub execution_id: Option<String>,
    /// Occurrences seen so far, including this one
    pub occurrence_count: u64,
}

impl DedupDecision {
    pub(crate) fn new_execution(key: String, execution_id: String) -> Self {
        Self {
            action: DedupAction::New,
            key,
            execution_id: Some(execution_id),
            occurrence_count: 1,
        }
    }

    pub(crate) fn duplicate(entry: &DeduplicationEntry) -> Self {
        Self {
            action: DedupAction::UpdateExisting,
            key: entry.key.clone(),
            execution_id: Some(entry.execution_id.clone()),
            occurrence_count: entry.occurrence_count,
        }
    }

    pub(crate) fn skip(key: String) -> Self {
        Self {
            action: DedupAction::Skip,
            key,
            execution_id: None,
            occurrence_count: 0,
        }
    }

    /// Whether the event belongs to an execution that already exists.
    pub fn is_duplicate(&self) -> bool {
        self.action != DedupAction::New
    }
}

/// One logical execution and its repeat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationEntry {
    pub key: String,
    /// Never changes for the life of the entry
    pub execution_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub ttl_secs: u64,
}

impl DeduplicationEntry {
    /// First occurrence of `key`.
    pub fn new(key: impl Into<String>, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            first_seen: now,
            last_seen: now,
            occurrence_count: 1,
            ttl_secs,
        }
    }

    /// Record a repeat occurrence.
    pub fn touch(&mut self) {
        self.occurrence_count += 1;
        self.last_seen = Utc::now();
    }
}

/// Common interface of the local and distributed variants.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Classify an event and record the occurrence.
    async fn check(&self, fingerprint: &EventFingerprint) -> DedupDecision;

    /// Current entry for `key`, if live.
    async fn lookup(&self, key: &str) -> Option<DeduplicationEntry>;

    /// Drop the entry for `key` so the next occurrence starts a new
    /// execution. Best effort.
    async fn forget(&self, key: &str);

    /// Variant name for logging.
    fn backend(&self) -> &'static str;
}
