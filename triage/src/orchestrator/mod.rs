//! Decision orchestration
//!
//! - [`state`]: decision states, reasons, the per-round record, human validation
//! - [`decision`]: the ordered transition rules over consensus + confidence
//! - [`registry`]: evaluator agents and the explicit registry the pipeline owns
//! - [`pipeline`]: dedup → fan-out → decide → checkpoint, one round per alert

pub mod decision;
pub mod pipeline;
pub mod registry;
pub mod state;

pub use decision::{
    state_for_label, Decision, DecisionOrchestrator, DEFAULT_MAJORITY_AUTO_THRESHOLD,
    DEFAULT_UNANIMOUS_AUTO_THRESHOLD,
};
pub use pipeline::{RoundError, RoundOutcome, RoundStatus, TriagePipeline};
pub use registry::{AgentRegistry, EvaluatorAgent, EvaluatorError, FixedOpinionAgent, SharedAgent};
pub use state::{DecisionReason, DecisionRecord, DecisionState, GovernanceError, HumanValidation};
