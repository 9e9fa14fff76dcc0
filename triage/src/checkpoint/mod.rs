//! Checkpoint / persistence layer
//!
//! Durable, ordered storage of orchestration steps per thread:
//!
//! ```text
//! Thread ──► Step(0) ──► Step(1) ──► ... ──► Step(n)
//!              │           │
//!              └─ AgentMemory (optional)
//! ```
//!
//! - [`CheckpointEngine`] is the entry point; every store call is wrapped
//!   in a [`RetryPolicy`](crate::retry::RetryPolicy).
//! - [`CheckpointStore`] is the storage seam. [`InMemoryCheckpointStore`]
//!   is always available; `RocksCheckpointStore` needs the `rocksdb`
//!   feature.
//! - Steps are append-only and strictly increasing in `step_index` per
//!   thread; retention deletes all but the newest N in one atomic change.

pub mod engine;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod store;
pub mod types;

pub use engine::{CheckpointEngine, CheckpointError, CheckpointResult, DEFAULT_KEEP_LAST};
pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksCheckpointStore, SharedRocksStore};
pub use store::{CheckpointStore, StoreError, StoreResult};
pub use types::{CheckpointRecord, Replay, StepPayload, ThreadInfo};
