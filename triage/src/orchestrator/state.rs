//! Decision state: outcome states, reasons, and the per-round record

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action state derived for one round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Approved,
    Rejected,
    Escalated,
    /// Needs a human before anything happens
    PendingHumanApproval,
    /// Keep watching, no action
    Monitoring,
    /// Not enough to decide on (no opinions, or the round timed out)
    Investigating,
}

impl DecisionState {
    /// Whether the state was reached without a human in the loop.
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected | Self::Escalated | Self::Monitoring
        )
    }
}

impl std::fmt::Display for DecisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Escalated => write!(f, "escalated"),
            Self::PendingHumanApproval => write!(f, "pending_human_approval"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::Investigating => write!(f, "investigating"),
        }
    }
}

/// Why a state was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    WeightedConsensus,
    UnanimousAgreement,
    MajorityVote,
    /// Exactly one opinion, not confident enough to act on alone
    ExpertDecision,
    LowConfidence,
    ConflictingOpinions,
    InsufficientData,
    /// Confidence diverged from the aggregate
    HallucinationDetected,
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WeightedConsensus => write!(f, "weighted_consensus"),
            Self::UnanimousAgreement => write!(f, "unanimous_agreement"),
            Self::MajorityVote => write!(f, "majority_vote"),
            Self::ExpertDecision => write!(f, "expert_decision"),
            Self::LowConfidence => write!(f, "low_confidence"),
            Self::ConflictingOpinions => write!(f, "conflicting_opinions"),
            Self::InsufficientData => write!(f, "insufficient_data"),
            Self::HallucinationDetected => write!(f, "hallucination_detected"),
        }
    }
}

/// Human confirm/reject of a decision. Annotation only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanValidation {
    pub decision_id: String,
    pub approved: bool,
    pub validated_by: String,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default = "Utc::now")]
    pub validated_at: DateTime<Utc>,
}

impl HumanValidation {
    pub fn new(decision_id: impl Into<String>, approved: bool, validated_by: impl Into<String>) -> Self {
        Self {
            decision_id: decision_id.into(),
            approved,
            validated_by: validated_by.into(),
            feedback: None,
            validated_at: Utc::now(),
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GovernanceError {
    #[error("decision {decision_id} was already validated by {validated_by}")]
    AlreadyValidated {
        decision_id: String,
        validated_by: String,
    },

    #[error("validation targets decision {got}, not {expected}")]
    DecisionMismatch { expected: String, got: String },

    #[error("validator must not be empty")]
    MissingValidator,
}

/// Outcome of one decision round.
///
/// Fields are fixed at creation. The only later change is the human
/// validation annotation, applied once through [`apply_validation`].
///
/// [`apply_validation`]: DecisionRecord::apply_validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub state: DecisionState,
    pub reason: DecisionReason,
    /// Governed confidence (confidence policy final score)
    pub confidence_score: f64,
    /// Consensus aggregate score
    pub weighted_score: f64,
    pub requires_human_review: bool,
    pub evidence_summary: String,
    pub recommended_action: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub validation: Option<HumanValidation>,
}

impl DecisionRecord {
    /// Attach the human validation. Never touches scores or state.
    pub fn apply_validation(&mut self, validation: HumanValidation) -> Result<(), GovernanceError> {
        if let Some(existing) = &self.validation {
            return Err(GovernanceError::AlreadyValidated {
                decision_id: self.id.clone(),
                validated_by: existing.validated_by.clone(),
            });
        }
        if validation.decision_id != self.id {
            return Err(GovernanceError::DecisionMismatch {
                expected: self.id.clone(),
                got: validation.decision_id,
            });
        }
        if validation.validated_by.trim().is_empty() {
            return Err(GovernanceError::MissingValidator);
        }
        self.validation = Some(validation);
        Ok(())
    }

    pub fn is_validated(&self) -> bool {
        self.validation.is_some()
    }

    /// Still waiting for a human.
    pub fn awaiting_review(&self) -> bool {
        self.requires_human_review && self.validation.is_none()
    }
}
