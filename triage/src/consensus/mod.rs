//! Consensus engine — weighted aggregation of evaluator opinions
//!
//! ```text
//! opinions ──► weight per role (static table × context)
//!          ──► aggregate = Σ(conf·w) / Σw
//!          ──► label tally ──► winning label, agreement ratio, kind
//!          ──► divergence check ──► anomaly note
//!          ──► strategy (weighted | unanimous | majority)
//! ```

pub mod engine;
pub mod strategy;

pub use engine::{
    AgentScore, ConsensusContext, ConsensusEngine, ConsensusKind, ConsensusOutcome,
    DEFAULT_CONFIDENCE_THRESHOLD,
};
pub use strategy::ConsensusStrategy;
