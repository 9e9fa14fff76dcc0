//! Consensus strategy variants layered on top of the weighted calculation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::{ConsensusKind, ConsensusOutcome};
use crate::error::ConfigError;

/// How a weighted outcome is turned into the round's consensus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum ConsensusStrategy {
    /// Plain weighted consensus
    Weighted,
    /// Valid only when every label matches; otherwise score 0 and review
    Unanimous,
    /// Winning label must hold at least `threshold` of the weight
    Majority { threshold: f64 },
}

impl ConsensusStrategy {
    /// Majority strategy with a validated threshold.
    pub fn majority(threshold: f64) -> Result<Self, ConfigError> {
        Ok(ConsensusStrategy::Majority {
            threshold: ConfigError::check_unit("consensus.majority_threshold", threshold)?,
        })
    }

    /// Re-check parameters on a deserialized value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ConsensusStrategy::Majority { threshold } = self {
            ConfigError::check_unit("consensus.majority_threshold", *threshold)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsensusStrategy::Weighted => "weighted",
            ConsensusStrategy::Unanimous => "unanimous",
            ConsensusStrategy::Majority { .. } => "majority",
        }
    }

    /// Post-process a weighted outcome.
    pub(crate) fn apply(&self, outcome: ConsensusOutcome) -> ConsensusOutcome {
        match self {
            ConsensusStrategy::Weighted => outcome,
            ConsensusStrategy::Unanimous => Self::require_unanimity(outcome),
            ConsensusStrategy::Majority { threshold } => Self::require_majority(outcome, *threshold),
        }
    }

    fn require_unanimity(outcome: ConsensusOutcome) -> ConsensusOutcome {
        match outcome.kind {
            ConsensusKind::Empty | ConsensusKind::SingleAgent | ConsensusKind::Unanimous => outcome,
            _ => {
                debug!(kind = %outcome.kind, "Unanimous strategy rejected disagreeing labels");
                ConsensusOutcome {
                    aggregate_score: 0.0,
                    kind: ConsensusKind::Split,
                    requires_human_review: true,
                    ..outcome
                }
            }
        }
    }

    fn require_majority(outcome: ConsensusOutcome, threshold: f64) -> ConsensusOutcome {
        match outcome.kind {
            ConsensusKind::Empty | ConsensusKind::SingleAgent | ConsensusKind::Unanimous => outcome,
            _ if outcome.agreement_ratio >= threshold => outcome,
            _ => {
                debug!(
                    agreement_ratio = outcome.agreement_ratio,
                    threshold, "Majority strategy found no majority"
                );
                ConsensusOutcome {
                    kind: ConsensusKind::NoMajority,
                    requires_human_review: true,
                    ..outcome
                }
            }
        }
    }
}

impl Default for ConsensusStrategy {
    fn default() -> Self {
        ConsensusStrategy::Weighted
    }
}

impl std::fmt::Display for ConsensusStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusStrategy::Majority { threshold } => write!(f, "majority({:.2})", threshold),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusContext, ConsensusEngine};
    use crate::opinion::{AgentOpinion, AgentRole};

    fn opinion(id: &str, role: AgentRole, confidence: f64, label: &str) -> AgentOpinion {
        AgentOpinion::new(id, role, confidence, 2, label, "").unwrap()
    }

    #[test]
    fn test_unanimous_strategy_accepts_agreement() {
        let engine = ConsensusEngine::default();
        let ops = vec![
            opinion("a", AgentRole::ThreatIntel, 0.9, "escalate"),
            opinion("b", AgentRole::LogAnalyzer, 0.9, "escalate"),
        ];
        let outcome = engine.evaluate(&ConsensusStrategy::Unanimous, &ops, &ConsensusContext::default());
        assert_eq!(outcome.kind, ConsensusKind::Unanimous);
        assert!((outcome.aggregate_score - 0.9).abs() < 1e-9);
        assert!(!outcome.requires_human_review);
    }

    #[test]
    fn test_unanimous_strategy_forces_review_on_disagreement() {
        let engine = ConsensusEngine::default();
        let ops = vec![
            opinion("a", AgentRole::ThreatIntel, 0.95, "escalate"),
            opinion("b", AgentRole::LogAnalyzer, 0.95, "escalate"),
            opinion("c", AgentRole::MetricsAnalyzer, 0.95, "monitor"),
        ];
        let outcome = engine.evaluate(&ConsensusStrategy::Unanimous, &ops, &ConsensusContext::default());
        assert_eq!(outcome.aggregate_score, 0.0);
        assert!(outcome.requires_human_review);
        assert_eq!(outcome.kind, ConsensusKind::Split);
    }

    #[test]
    fn test_majority_strategy_below_threshold() {
        let engine = ConsensusEngine::default();
        // escalate share = 2.0 / 3.5 ≈ 0.571
        let ops = vec![
            opinion("a", AgentRole::ThreatIntel, 0.9, "escalate"),
            opinion("b", AgentRole::LogAnalyzer, 0.9, "monitor"),
        ];
        let strict = ConsensusStrategy::majority(0.66).unwrap();
        let outcome = engine.evaluate(&strict, &ops, &ConsensusContext::default());
        assert_eq!(outcome.kind, ConsensusKind::NoMajority);
        assert!(outcome.requires_human_review);
        assert!((outcome.aggregate_score - 0.9).abs() < 1e-9);

        let lenient = ConsensusStrategy::majority(0.5).unwrap();
        let outcome = engine.evaluate(&lenient, &ops, &ConsensusContext::default());
        assert_eq!(outcome.kind, ConsensusKind::Majority);
        assert!(!outcome.requires_human_review);
    }

    #[test]
    fn test_weighted_strategy_is_identity() {
        let engine = ConsensusEngine::default();
        let ops = vec![opinion("a", AgentRole::PolicyChecker, 0.4, "approve")];
        let ctx = ConsensusContext::default();
        assert_eq!(
            engine.evaluate(&ConsensusStrategy::Weighted, &ops, &ctx),
            engine.calculate(&ops, &ctx)
        );
    }

    #[test]
    fn test_majority_threshold_validation() {
        assert!(ConsensusStrategy::majority(1.2).is_err());
        assert!(ConsensusStrategy::Majority { threshold: -1.0 }.validate().is_err());
        assert!(ConsensusStrategy::Unanimous.validate().is_ok());
    }

    #[test]
    fn test_strategy_serde_and_display() {
        let json = serde_json::to_string(&ConsensusStrategy::Majority { threshold: 0.6 }).unwrap();
        assert_eq!(json, r#"{"strategy":"majority","threshold":0.6}"#);
        let parsed: ConsensusStrategy = serde_json::from_str(r#"{"strategy":"unanimous"}"#).unwrap();
        assert_eq!(parsed, ConsensusStrategy::Unanimous);
        assert_eq!(ConsensusStrategy::Majority { threshold: 0.6 }.to_string(), "majority(0.60)");
        assert_eq!(ConsensusStrategy::default().to_string(), "weighted");
    }
}
