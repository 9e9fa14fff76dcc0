//! RocksDB-backed checkpoint store
//!
//! Column families separate the Thread → Step → AgentMemory levels while
//! sharing one RocksDB instance. Step keys zero-pad the index so the
//! natural key order is `step_index` order. Values are JSON.
//!
//! Writes that read before they write (thread upsert, step append,
//! retention) are serialized by one mutex, so an order check and the
//! batch that follows it cannot interleave with another append.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::store::{check_append_order, AppendCheck, CheckpointStore, StoreError, StoreResult};
use super::types::{CheckpointRecord, ThreadInfo};

/// Column family and key layout
pub mod schema {
    /// Column family for thread metadata
    pub const CF_THREADS: &str = "threads";

    /// Column family for step records (without agent memory)
    pub const CF_STEPS: &str = "steps";

    /// Column family for agent memory snapshots, keyed like steps
    pub const CF_MEMORY: &str = "memory";

    /// All column family names
    pub const ALL_CFS: &[&str] = &[CF_THREADS, CF_STEPS, CF_MEMORY];

    pub mod keys {
        pub fn thread(thread_id: &str) -> String {
            format!("thread:{}", thread_id)
        }

        /// Prefix shared by every step of a thread
        pub fn step_prefix(thread_id: &str) -> String {
            format!("step:{}:", thread_id)
        }

        /// Step key (zero-padded index for ordering)
        pub fn step(thread_id: &str, step_index: u64) -> String {
            format!("step:{}:{:020}", thread_id, step_index)
        }

        /// Parse the step index from a key under `prefix`.
        ///
        /// Thread ids may contain `:`, so a key can share the prefix of a
        /// different thread; only an exact 20-digit suffix belongs here.
        pub fn parse_step_index(prefix: &str, key: &str) -> Option<u64> {
            let suffix = key.strip_prefix(prefix)?;
            if suffix.len() != 20 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            suffix.parse().ok()
        }
    }
}

use schema::{keys, ALL_CFS, CF_MEMORY, CF_STEPS, CF_THREADS};

/// Shared reference to a RocksCheckpointStore
pub type SharedRocksStore = Arc<RocksCheckpointStore>;

/// Persistent [`CheckpointStore`] on RocksDB.
pub struct RocksCheckpointStore {
    db: RwLock<DB>,
    writes: Mutex<()>,
    path: PathBuf,
}

impl RocksCheckpointStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
        debug!(path = %path.display(), "Opened checkpoint store");

        Ok(Self {
            db: RwLock::new(db),
            writes: Mutex::new(()),
            path,
        })
    }

    pub fn shared(self) -> SharedRocksStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn write_guard(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.writes.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        db.put_cf(cf, key.as_bytes(), encode(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Step keys of a thread in ascending index order.
    fn step_keys(&self, thread_id: &str) -> StoreResult<Vec<(u64, String)>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(CF_STEPS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(CF_STEPS.to_string()))?;

        let prefix = keys::step_prefix(thread_id);
        let mut found = Vec::new();

        for result in db.prefix_iterator_cf(cf, prefix.as_bytes()) {
            let (key, _) = result?;
            let Ok(key_str) = String::from_utf8(key.to_vec()) else {
                continue;
            };
            if !key_str.starts_with(&prefix) {
                break; // Prefix no longer matches
            }
            if let Some(index) = keys::parse_step_index(&prefix, &key_str) {
                found.push((index, key_str));
            }
        }

        Ok(found)
    }

    fn read_step(&self, key: &str) -> StoreResult<Option<CheckpointRecord>> {
        let Some(mut record) = self.get::<CheckpointRecord>(CF_STEPS, key)? else {
            return Ok(None);
        };
        record.agent_memory_snapshot = self.get(CF_MEMORY, key)?;
        Ok(Some(record))
    }

    fn latest_step(&self, thread_id: &str) -> StoreResult<Option<CheckpointRecord>> {
        match self.step_keys(thread_id)?.last() {
            Some((_, key)) => self.read_step(key),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CheckpointStore for RocksCheckpointStore {
    async fn upsert_thread(&self, thread_id: &str) -> StoreResult<ThreadInfo> {
        let _writes = self.write_guard()?;
        let key = keys::thread(thread_id);
        let info = match self.get::<ThreadInfo>(CF_THREADS, &key)? {
            Some(mut info) => {
                info.touch();
                info
            }
            None => ThreadInfo::new(thread_id),
        };
        self.put(CF_THREADS, &key, &info)?;
        Ok(info)
    }

    async fn get_thread(&self, thread_id: &str) -> StoreResult<Option<ThreadInfo>> {
        self.get(CF_THREADS, &keys::thread(thread_id))
    }

    async fn append_step(&self, record: &CheckpointRecord) -> StoreResult<()> {
        let _writes = self.write_guard()?;
        let thread_key = keys::thread(&record.thread_id);
        let mut info: ThreadInfo = self
            .get(CF_THREADS, &thread_key)?
            .ok_or_else(|| StoreError::ThreadNotFound(record.thread_id.clone()))?;

        let latest = self.latest_step(&record.thread_id)?;
        if check_append_order(&info, latest.as_ref(), record)? == AppendCheck::AlreadyStored {
            return Ok(());
        }

        let step_key = keys::step(&record.thread_id, record.step_index);
        let mut step = record.clone();
        let memory = step.agent_memory_snapshot.take();
        info.record_step(record.step_index);

        let mut batch = WriteBatch::default();
        {
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let steps_cf = db
                .cf_handle(CF_STEPS)
                .ok_or_else(|| StoreError::ColumnFamilyNotFound(CF_STEPS.to_string()))?;
            let threads_cf = db
                .cf_handle(CF_THREADS)
                .ok_or_else(|| StoreError::ColumnFamilyNotFound(CF_THREADS.to_string()))?;

            batch.put_cf(steps_cf, step_key.as_bytes(), encode(&step)?);
            batch.put_cf(threads_cf, thread_key.as_bytes(), encode(&info)?);
            if let Some(memory) = &memory {
                let memory_cf = db
                    .cf_handle(CF_MEMORY)
                    .ok_or_else(|| StoreError::ColumnFamilyNotFound(CF_MEMORY.to_string()))?;
                batch.put_cf(memory_cf, step_key.as_bytes(), encode(memory)?);
            }
            db.write(batch)?;
        }
        Ok(())
    }

    async fn get_step(&self, thread_id: &str, step_index: u64) -> StoreResult<Option<CheckpointRecord>> {
        self.read_step(&keys::step(thread_id, step_index))
    }

    async fn list_steps(&self, thread_id: &str) -> StoreResult<Vec<CheckpointRecord>> {
        let mut steps = Vec::new();
        for (_, key) in self.step_keys(thread_id)? {
            if let Some(record) = self.read_step(&key)? {
                steps.push(record);
            }
        }
        Ok(steps)
    }

    async fn retain_latest(&self, thread_id: &str, keep_last: usize) -> StoreResult<usize> {
        let _writes = self.write_guard()?;
        let keys = self.step_keys(thread_id)?;
        let excess = keys.len().saturating_sub(keep_last);
        if excess == 0 {
            return Ok(0);
        }

        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let steps_cf = db
            .cf_handle(CF_STEPS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(CF_STEPS.to_string()))?;
        let memory_cf = db
            .cf_handle(CF_MEMORY)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(CF_MEMORY.to_string()))?;

        let mut batch = WriteBatch::default();
        for (_, key) in keys.iter().take(excess) {
            batch.delete_cf(steps_cf, key.as_bytes());
            batch.delete_cf(memory_cf, key.as_bytes());
        }
        db.write(batch)?;

        debug!(thread_id, deleted = excess, "Pruned checkpoint steps");
        Ok(excess)
    }

    fn backend(&self) -> &'static str {
        "rocksdb"
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}
