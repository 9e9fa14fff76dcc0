//! Alert triage engine
//!
//! Triages incoming observability alerts through a multi-evaluator
//! decision pipeline:
//! - Deduplication of repeated events onto one execution thread
//!   (in-process, or shared through a key-value store)
//! - Weighted consensus over evaluator opinions with anomaly detection
//! - A confidence policy blending the consensus with supporting evidence
//! - An ordered decision state machine with human-review governance
//! - Durable, retried, append-only checkpoints per thread
//!
//! # Usage
//!
//! ```bash
//! # Decide a recorded round (opinions + evidence) and print the decision
//! triage decide --input round.json
//!
//! # Run the full pipeline over a recorded round
//! triage run --input round.json
//!
//! # Print the effective configuration
//! TRIAGE_CONSENSUS_THRESHOLD=0.75 triage config --config triage.toml
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod checkpoint;
pub mod confidence;
pub mod config;
pub mod consensus;
pub mod dedup;
pub mod error;
pub mod opinion;
pub mod orchestrator;
pub mod retry;

// Re-export key types
pub use checkpoint::{
    CheckpointEngine, CheckpointError, CheckpointRecord, CheckpointStore, InMemoryCheckpointStore,
    Replay, StepPayload, StoreError,
};
#[cfg(feature = "rocksdb")]
pub use checkpoint::RocksCheckpointStore;
pub use confidence::{AnomalyFlag, ConfidenceAssessment, ConfidenceLevel, ConfidencePolicy};
pub use config::TriageConfig;
pub use consensus::{ConsensusContext, ConsensusEngine, ConsensusKind, ConsensusOutcome, ConsensusStrategy};
pub use dedup::{
    DedupAction, DedupDecision, DeduplicationEntry, Deduplicator, DistributedDeduplicator,
    EventFingerprint, InMemoryKvStore, KeyValueStore, LocalDeduplicator,
};
pub use error::{ConfigError, ValidationError};
pub use opinion::{AgentOpinion, AgentRole, AlertEvent, EvidenceItem};
pub use orchestrator::{
    AgentRegistry, DecisionOrchestrator, DecisionReason, DecisionRecord, DecisionState,
    EvaluatorAgent, FixedOpinionAgent, HumanValidation, RoundOutcome, RoundStatus, TriagePipeline,
};
pub use retry::RetryPolicy;
