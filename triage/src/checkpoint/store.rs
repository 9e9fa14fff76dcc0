//! Storage seam for checkpoints.

use async_trait::async_trait;

use super::types::{CheckpointRecord, ThreadInfo};
use crate::retry::Transient;

/// Error type for checkpoint store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("step {step_index} for thread {thread_id} is out of order (latest is {latest})")]
    OutOfOrder {
        thread_id: String,
        step_index: u64,
        latest: u64,
    },

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[cfg(feature = "rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            #[cfg(feature = "rocksdb")]
            StoreError::RocksDb(e) => matches!(
                e.kind(),
                rocksdb::ErrorKind::Busy
                    | rocksdb::ErrorKind::TryAgain
                    | rocksdb::ErrorKind::TimedOut
                    | rocksdb::ErrorKind::IOError
                    | rocksdb::ErrorKind::Incomplete
            ),
            _ => false,
        }
    }
}

/// Result type for checkpoint store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// An ordered Thread → Step → AgentMemory store.
///
/// Implementations must keep steps of a thread ordered by `step_index`
/// and reject an append whose index is not greater than the latest one.
/// Re-appending the exact record already stored at the latest index
/// (same `id`) succeeds, so a retried append that actually landed is
/// not reported as a conflict.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create the thread if missing, otherwise bump `updated_at`.
    async fn upsert_thread(&self, thread_id: &str) -> StoreResult<ThreadInfo>;

    async fn get_thread(&self, thread_id: &str) -> StoreResult<Option<ThreadInfo>>;

    /// Append a step. The thread must exist.
    async fn append_step(&self, record: &CheckpointRecord) -> StoreResult<()>;

    async fn get_step(&self, thread_id: &str, step_index: u64) -> StoreResult<Option<CheckpointRecord>>;

    /// All steps of a thread, ascending by `step_index`.
    async fn list_steps(&self, thread_id: &str) -> StoreResult<Vec<CheckpointRecord>>;

    /// Delete all but the `keep_last` highest steps in one atomic change.
    /// Returns the number of steps deleted.
    async fn retain_latest(&self, thread_id: &str, keep_last: usize) -> StoreResult<usize>;

    /// Backend name for logging.
    fn backend(&self) -> &'static str;
}

/// Shared append-order check used by the store implementations.
///
/// `latest` is the newest surviving step; `thread.last_step_index` also
/// covers steps that retention has since deleted.
pub(crate) fn check_append_order(
    thread: &ThreadInfo,
    latest: Option<&CheckpointRecord>,
    record: &CheckpointRecord,
) -> StoreResult<AppendCheck> {
    if let Some(last) = latest {
        if last.step_index == record.step_index && last.id == record.id {
            return Ok(AppendCheck::AlreadyStored);
        }
    }
    let high_water = thread
        .last_step_index
        .into_iter()
        .chain(latest.map(|last| last.step_index))
        .max();
    match high_water {
        Some(high) if record.step_index <= high => Err(StoreError::OutOfOrder {
            thread_id: record.thread_id.clone(),
            step_index: record.step_index,
            latest: high,
        }),
        _ => Ok(AppendCheck::Append),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendCheck {
    Append,
    AlreadyStored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::types::StepPayload;
    use serde_json::json;

    #[test]
    fn test_append_order() {
        let mut thread = ThreadInfo::new("t");
        let first = CheckpointRecord::new("t", 1, StepPayload::new(json!(1)));
        assert_eq!(check_append_order(&thread, None, &first).unwrap(), AppendCheck::Append);
        thread.record_step(1);
        assert_eq!(
            check_append_order(&thread, Some(&first), &first).unwrap(),
            AppendCheck::AlreadyStored
        );

        let same_index = CheckpointRecord::new("t", 1, StepPayload::new(json!(2)));
        assert!(matches!(
            check_append_order(&thread, Some(&first), &same_index),
            Err(StoreError::OutOfOrder { latest: 1, .. })
        ));

        let next = CheckpointRecord::new("t", 2, StepPayload::new(json!(3)));
        assert_eq!(
            check_append_order(&thread, Some(&first), &next).unwrap(),
            AppendCheck::Append
        );
    }

    #[test]
    fn test_append_order_remembers_pruned_steps() {
        let mut thread = ThreadInfo::new("t");
        thread.record_step(3);

        // every step pruned: nothing survives but the high-water mark
        let reused = CheckpointRecord::new("t", 0, StepPayload::new(json!(0)));
        assert!(matches!(
            check_append_order(&thread, None, &reused),
            Err(StoreError::OutOfOrder { latest: 3, .. })
        ));

        let next = CheckpointRecord::new("t", 4, StepPayload::new(json!(4)));
        assert_eq!(check_append_order(&thread, None, &next).unwrap(), AppendCheck::Append);
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::LockPoisoned.is_transient());
        assert!(!StoreError::OutOfOrder {
            thread_id: "t".into(),
            step_index: 1,
            latest: 2
        }
        .is_transient());
    }
}
