//! In-memory checkpoint store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::{check_append_order, AppendCheck, CheckpointStore, StoreError, StoreResult};
use super::types::{CheckpointRecord, ThreadInfo};

#[derive(Debug)]
struct ThreadNode {
    info: ThreadInfo,
    steps: BTreeMap<u64, CheckpointRecord>,
}

/// Process-local [`CheckpointStore`]. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    threads: RwLock<HashMap<String, ThreadNode>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn thread_count(&self) -> usize {
        self.threads.read().await.len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn upsert_thread(&self, thread_id: &str) -> StoreResult<ThreadInfo> {
        let mut threads = self.threads.write().await;
        let node = threads
            .entry(thread_id.to_string())
            .and_modify(|node| node.info.touch())
            .or_insert_with(|| ThreadNode {
                info: ThreadInfo::new(thread_id),
                steps: BTreeMap::new(),
            });
        Ok(node.info.clone())
    }

    async fn get_thread(&self, thread_id: &str) -> StoreResult<Option<ThreadInfo>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .map(|node| node.info.clone()))
    }

    async fn append_step(&self, record: &CheckpointRecord) -> StoreResult<()> {
        let mut threads = self.threads.write().await;
        let node = threads
            .get_mut(&record.thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(record.thread_id.clone()))?;

        let latest = node.steps.values().next_back();
        if check_append_order(&node.info, latest, record)? == AppendCheck::Append {
            node.steps.insert(record.step_index, record.clone());
            node.info.record_step(record.step_index);
        }
        Ok(())
    }

    async fn get_step(&self, thread_id: &str, step_index: u64) -> StoreResult<Option<CheckpointRecord>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .and_then(|node| node.steps.get(&step_index).cloned()))
    }

    async fn list_steps(&self, thread_id: &str) -> StoreResult<Vec<CheckpointRecord>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .map(|node| node.steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn retain_latest(&self, thread_id: &str, keep_last: usize) -> StoreResult<usize> {
        let mut threads = self.threads.write().await;
        let Some(node) = threads.get_mut(thread_id) else {
            return Ok(0);
        };
        let excess = node.steps.len().saturating_sub(keep_last);
        if excess == 0 {
            return Ok(0);
        }
        let doomed: Vec<u64> = node.steps.keys().take(excess).copied().collect();
        for index in &doomed {
            node.steps.remove(index);
        }
        Ok(doomed.len())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
