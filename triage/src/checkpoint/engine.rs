//! Checkpoint engine: retried, ordered step persistence per thread.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::memory::InMemoryCheckpointStore;
use super::store::{CheckpointStore, StoreError};
use super::types::{CheckpointRecord, Replay, StepPayload};
use crate::retry::{RetryPolicy, Transient};

/// Default number of steps kept per thread by retention.
pub const DEFAULT_KEEP_LAST: usize = 20;

/// Fresh indices [`CheckpointEngine::append_next`] tries when a writer in
/// another process takes the index first.
const MAX_APPEND_CONFLICTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("step {step_index} not found for thread {thread_id}")]
    NotFound { thread_id: String, step_index: u64 },

    #[error("thread id must not be empty")]
    EmptyThreadId,
}

impl Transient for CheckpointError {
    fn is_transient(&self) -> bool {
        match self {
            CheckpointError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Wraps a [`CheckpointStore`] with the retry policy.
///
/// Every store call goes through [`RetryPolicy::run`]; a call that still
/// fails after the last attempt returns its error to the caller, which
/// decides whether that is fatal (the pipeline treats it as soft).
///
/// Clones share the per-thread append locks used by
/// [`append_next`](Self::append_next).
#[derive(Clone)]
pub struct CheckpointEngine {
    store: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    appends: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl CheckpointEngine {
    pub fn new(store: Arc<dyn CheckpointStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            appends: Arc::new(DashMap::new()),
        }
    }

    /// Engine over a fresh in-memory store with the default retry policy.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointStore::new()), RetryPolicy::default())
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Create or merge the thread and append one immutable step.
    /// Returns the checkpoint id.
    pub async fn persist_step(
        &self,
        thread_id: &str,
        step_index: u64,
        payload: StepPayload,
    ) -> CheckpointResult<String> {
        if thread_id.trim().is_empty() {
            return Err(CheckpointError::EmptyThreadId);
        }
        let record = CheckpointRecord::new(thread_id, step_index, payload);

        self.retry
            .run("upsert_thread", || self.store.upsert_thread(thread_id))
            .await?;
        self.retry
            .run("append_step", || self.store.append_step(&record))
            .await?;

        debug!(
            thread_id,
            step_index,
            checkpoint_id = %record.id,
            backend = self.store.backend(),
            "Persisted checkpoint step"
        );
        Ok(record.id)
    }

    /// Append `payload` as the next step of `thread_id`.
    /// Returns the step index used and the checkpoint id.
    ///
    /// Appends to one thread through this engine and its clones run one
    /// at a time, from reading the next index to the write.
    pub async fn append_next(
        &self,
        thread_id: &str,
        payload: StepPayload,
    ) -> CheckpointResult<(u64, String)> {
        if thread_id.trim().is_empty() {
            return Err(CheckpointError::EmptyThreadId);
        }

        let lock = self.appends.entry(thread_id.to_string()).or_default().clone();
        let result = {
            let _held = lock.lock().await;
            self.append_next_locked(thread_id, payload).await
        };
        drop(lock);
        self.appends
            .remove_if(thread_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn append_next_locked(
        &self,
        thread_id: &str,
        payload: StepPayload,
    ) -> CheckpointResult<(u64, String)> {
        let mut conflicts = 0;
        loop {
            let step_index = self.next_step_index(thread_id).await?;
            match self.persist_step(thread_id, step_index, payload.clone()).await {
                Ok(id) => return Ok((step_index, id)),
                Err(CheckpointError::Store(StoreError::OutOfOrder { latest, .. }))
                    if conflicts + 1 < MAX_APPEND_CONFLICTS =>
                {
                    conflicts += 1;
                    debug!(thread_id, step_index, latest, "Step index taken by another writer, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn load_step(
        &self,
        thread_id: &str,
        step_index: u64,
    ) -> CheckpointResult<Option<CheckpointRecord>> {
        Ok(self
            .retry
            .run("get_step", || self.store.get_step(thread_id, step_index))
            .await?)
    }

    /// Steps of a thread in ascending `step_index` order.
    pub async fn list_steps(&self, thread_id: &str) -> CheckpointResult<Vec<CheckpointRecord>> {
        Ok(self
            .retry
            .run("list_steps", || self.store.list_steps(thread_id))
            .await?)
    }

    /// The step at `step_index` and every later step, for resuming.
    pub async fn replay_from(&self, thread_id: &str, step_index: u64) -> CheckpointResult<Replay> {
        let steps: Vec<CheckpointRecord> = self
            .list_steps(thread_id)
            .await?
            .into_iter()
            .filter(|record| record.step_index >= step_index)
            .collect();

        match steps.first() {
            Some(first) if first.step_index == step_index => Ok(Replay {
                thread_id: thread_id.to_string(),
                from_step: step_index,
                steps,
            }),
            _ => Err(CheckpointError::NotFound {
                thread_id: thread_id.to_string(),
                step_index,
            }),
        }
    }

    /// Delete all but the `keep_last` highest steps. Returns the number deleted.
    pub async fn cleanup_old(&self, thread_id: &str, keep_last: usize) -> CheckpointResult<usize> {
        let deleted = self
            .retry
            .run("retain_latest", || self.store.retain_latest(thread_id, keep_last))
            .await?;
        if deleted > 0 {
            info!(thread_id, deleted, keep_last, "Cleaned up old checkpoint steps");
        }
        Ok(deleted)
    }

    pub async fn latest_step(&self, thread_id: &str) -> CheckpointResult<Option<CheckpointRecord>> {
        Ok(self.list_steps(thread_id).await?.pop())
    }

    /// Index the next step of `thread_id` should use (0 for a new thread).
    ///
    /// Never reuses an index, including ones retention has deleted.
    pub async fn next_step_index(&self, thread_id: &str) -> CheckpointResult<u64> {
        let high_water = self
            .retry
            .run("get_thread", || self.store.get_thread(thread_id))
            .await?
            .map_or(0, |thread| thread.next_step_index());
        let surviving = self
            .latest_step(thread_id)
            .await?
            .map_or(0, |record| record.step_index + 1);
        Ok(high_water.max(surviving))
    }
}

impl std::fmt::Debug for CheckpointEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointEngine")
            .field("backend", &self.store.backend())
            .field("retry", &self.retry)
            .finish()
    }
}
