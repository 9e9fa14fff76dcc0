//! Decision orchestrator — derives an action state from consensus and confidence
//!
//! Rules are checked in order; the first match wins:
//!
//! 1. no opinions → `Investigating` / `InsufficientData`
//! 2. aggregate below the review threshold → `PendingHumanApproval` / `LowConfidence`
//! 3. anomaly flagged → `PendingHumanApproval` / `HallucinationDetected`
//! 4. unanimous and aggregate > 0.85 → label state / `UnanimousAgreement`
//! 5. (strong) majority and aggregate > 0.8 → label state / `MajorityVote`
//! 6. otherwise → `PendingHumanApproval` / `ConflictingOpinions`
//!    (`ExpertDecision` for a single opinion)

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::state::{DecisionReason, DecisionRecord, DecisionState};
use crate::confidence::{ConfidenceAssessment, ConfidenceContext, ConfidencePolicy};
use crate::config::TriageConfig;
use crate::consensus::{ConsensusContext, ConsensusEngine, ConsensusKind, ConsensusOutcome, ConsensusStrategy};
use crate::error::{ConfigError, ValidationError};
use crate::opinion::{normalize_label, AgentOpinion, EvidenceItem};

/// Unanimous rounds act automatically only above this aggregate.
pub const DEFAULT_UNANIMOUS_AUTO_THRESHOLD: f64 = 0.85;

/// Majority rounds act automatically only above this aggregate.
pub const DEFAULT_MAJORITY_AUTO_THRESHOLD: f64 = 0.8;

/// Map a result label onto the action state it asks for.
pub fn state_for_label(label: &str) -> DecisionState {
    match normalize_label(label).as_str() {
        "escalate" | "escalated" | "critical" | "incident" => DecisionState::Escalated,
        "approve" | "approved" | "resolve" | "resolved" | "benign" | "false_positive" => {
            DecisionState::Approved
        }
        "reject" | "rejected" | "suppress" | "suppressed" => DecisionState::Rejected,
        _ => DecisionState::Monitoring,
    }
}

fn recommended_action(state: DecisionState) -> &'static str {
    match state {
        DecisionState::Escalated => "page the on-call responder",
        DecisionState::Approved => "close the alert",
        DecisionState::Rejected => "suppress the alert",
        DecisionState::Monitoring => "keep monitoring",
        DecisionState::PendingHumanApproval => "route to a human analyst for review",
        DecisionState::Investigating => "collect more data and re-run triage",
    }
}

/// Everything one round produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub record: DecisionRecord,
    pub consensus: ConsensusOutcome,
    pub assessment: ConfidenceAssessment,
}

/// Owns the consensus engine, strategy and confidence policy, and turns
/// a round's opinions into a [`DecisionRecord`].
#[derive(Debug, Clone)]
pub struct DecisionOrchestrator {
    engine: ConsensusEngine,
    strategy: ConsensusStrategy,
    policy: ConfidencePolicy,
    unanimous_auto_threshold: f64,
    majority_auto_threshold: f64,
}

impl DecisionOrchestrator {
    pub fn new(engine: ConsensusEngine, strategy: ConsensusStrategy, policy: ConfidencePolicy) -> Self {
        Self {
            engine,
            strategy,
            policy,
            unanimous_auto_threshold: DEFAULT_UNANIMOUS_AUTO_THRESHOLD,
            majority_auto_threshold: DEFAULT_MAJORITY_AUTO_THRESHOLD,
        }
    }

    pub fn from_config(config: &TriageConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.consensus.build_engine()?,
            config.consensus.build_strategy()?,
            config.confidence.build_policy()?,
        )
        .with_auto_thresholds(
            config.orchestrator.unanimous_auto_threshold,
            config.orchestrator.majority_auto_threshold,
        )
    }

    pub fn with_auto_thresholds(mut self, unanimous: f64, majority: f64) -> Result<Self, ConfigError> {
        self.unanimous_auto_threshold =
            ConfigError::check_unit("orchestrator.unanimous_auto_threshold", unanimous)?;
        self.majority_auto_threshold =
            ConfigError::check_unit("orchestrator.majority_auto_threshold", majority)?;
        Ok(self)
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn strategy(&self) -> &ConsensusStrategy {
        &self.strategy
    }

    pub fn policy(&self) -> &ConfidencePolicy {
        &self.policy
    }

    /// Run consensus and confidence over a round and derive the decision.
    ///
    /// Any malformed opinion or evidence item aborts the round.
    pub fn decide(
        &self,
        opinions: &[AgentOpinion],
        evidence: &[EvidenceItem],
        context: &ConsensusContext,
    ) -> Result<Decision, ValidationError> {
        for opinion in opinions {
            opinion.validate()?;
        }

        let consensus = self.engine.evaluate(&self.strategy, opinions, context);
        let assessment = self.policy.calculate(
            consensus.aggregate_score,
            evidence,
            &ConfidenceContext::for_subject("round"),
        )?;

        let (state, reason) = self.derive_state(opinions.len(), &consensus, &assessment);
        let record = self.build_record(state, reason, opinions, evidence, &consensus, &assessment);

        info!(
            decision_id = %record.id,
            state = %record.state,
            reason = %record.reason,
            aggregate = consensus.aggregate_score,
            kind = %consensus.kind,
            review = record.requires_human_review,
            "Decision derived"
        );

        Ok(Decision {
            record,
            consensus,
            assessment,
        })
    }

    /// The ordered transition rules.
    pub fn derive_state(
        &self,
        opinion_count: usize,
        consensus: &ConsensusOutcome,
        assessment: &ConfidenceAssessment,
    ) -> (DecisionState, DecisionReason) {
        if opinion_count == 0 || consensus.kind == ConsensusKind::Empty {
            return (DecisionState::Investigating, DecisionReason::InsufficientData);
        }

        let score = consensus.aggregate_score;
        if score < self.engine.threshold() {
            return (DecisionState::PendingHumanApproval, DecisionReason::LowConfidence);
        }

        if assessment.is_likely_anomaly() || consensus.has_anomaly() {
            return (
                DecisionState::PendingHumanApproval,
                DecisionReason::HallucinationDetected,
            );
        }

        let label_state = consensus.winning_label.as_deref().map(state_for_label);

        if consensus.kind == ConsensusKind::Unanimous && score > self.unanimous_auto_threshold {
            if let Some(state) = label_state {
                return (state, DecisionReason::UnanimousAgreement);
            }
        }

        if consensus.kind.is_majority() && score > self.majority_auto_threshold {
            if let Some(state) = label_state {
                return (state, DecisionReason::MajorityVote);
            }
        }

        if opinion_count == 1 {
            (DecisionState::PendingHumanApproval, DecisionReason::ExpertDecision)
        } else {
            (DecisionState::PendingHumanApproval, DecisionReason::ConflictingOpinions)
        }
    }

    /// Record for a round that ran out of time before deciding.
    pub fn timed_out(&self, collected: usize) -> DecisionRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert("timed_out".to_string(), Value::Bool(true));
        metadata.insert("opinions_collected".to_string(), json!(collected));

        DecisionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            state: DecisionState::Investigating,
            reason: DecisionReason::InsufficientData,
            confidence_score: 0.0,
            weighted_score: 0.0,
            requires_human_review: true,
            evidence_summary: format!("round timed out after {} opinion(s)", collected),
            recommended_action: recommended_action(DecisionState::Investigating).to_string(),
            metadata,
            timestamp: Utc::now(),
            checkpoint_id: None,
            validation: None,
        }
    }

    fn build_record(
        &self,
        state: DecisionState,
        reason: DecisionReason,
        opinions: &[AgentOpinion],
        evidence: &[EvidenceItem],
        consensus: &ConsensusOutcome,
        assessment: &ConfidenceAssessment,
    ) -> DecisionRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert("consensus_kind".to_string(), json!(consensus.kind));
        metadata.insert("strategy".to_string(), json!(self.strategy.name()));
        metadata.insert("winning_label".to_string(), json!(consensus.winning_label));
        metadata.insert("agreement_ratio".to_string(), json!(consensus.agreement_ratio));
        metadata.insert("opinion_count".to_string(), json!(opinions.len()));
        metadata.insert("confidence_level".to_string(), json!(assessment.confidence_level));
        metadata.insert("anomaly_flag".to_string(), json!(assessment.anomaly_flag));
        if !consensus.anomalous_agents.is_empty() {
            metadata.insert("anomalous_agents".to_string(), json!(consensus.anomalous_agents));
        }

        DecisionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            reason,
            confidence_score: assessment.final_score,
            weighted_score: consensus.aggregate_score,
            requires_human_review: state == DecisionState::PendingHumanApproval
                || consensus.requires_human_review,
            evidence_summary: summarize(opinions, evidence, consensus),
            recommended_action: recommended_action(state).to_string(),
            metadata,
            timestamp: Utc::now(),
            checkpoint_id: None,
            validation: None,
        }
    }
}

impl Default for DecisionOrchestrator {
    fn default() -> Self {
        Self::new(
            ConsensusEngine::default(),
            ConsensusStrategy::default(),
            ConfidencePolicy::default(),
        )
    }
}

/// e.g. "3 opinions (escalate: 2, monitor: 1), 2 evidence items, strong_majority at 0.839"
fn summarize(opinions: &[AgentOpinion], evidence: &[EvidenceItem], consensus: &ConsensusOutcome) -> String {
    let mut labels: BTreeMap<String, usize> = BTreeMap::new();
    for opinion in opinions {
        *labels.entry(opinion.normalized_label()).or_default() += 1;
    }
    let breakdown = labels
        .iter()
        .map(|(label, count)| format!("{}: {}", label, count))
        .collect::<Vec<_>>()
        .join(", ");

    let mut summary = format!(
        "{} opinion(s) ({}), {} evidence item(s), {} at {:.3}",
        opinions.len(),
        breakdown,
        evidence.len(),
        consensus.kind,
        consensus.aggregate_score
    );
    if let Some(note) = &consensus.anomaly_note {
        summary.push_str("; ");
        summary.push_str(note);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opinion::AgentRole;

    fn make_opinion(id: &str, role: AgentRole, confidence: f64, label: &str) -> AgentOpinion {
        AgentOpinion::new(id, role, confidence, 2, label, "test").unwrap()
    }

    fn decide(opinions: &[AgentOpinion]) -> Decision {
        DecisionOrchestrator::default()
            .decide(opinions, &[], &ConsensusContext::default())
            .unwrap()
    }

    #[test]
    fn test_label_mapping() {
        assert_eq!(state_for_label("Escalate"), DecisionState::Escalated);
        assert_eq!(state_for_label(" critical "), DecisionState::Escalated);
        assert_eq!(state_for_label("benign"), DecisionState::Approved);
        assert_eq!(state_for_label("suppress"), DecisionState::Rejected);
        assert_eq!(state_for_label("monitor"), DecisionState::Monitoring);
        assert_eq!(state_for_label("something-else"), DecisionState::Monitoring);
    }

    #[test]
    fn test_no_opinions_investigating() {
        let decision = decide(&[]);
        assert_eq!(decision.record.state, DecisionState::Investigating);
        assert_eq!(decision.record.reason, DecisionReason::InsufficientData);
        assert!(decision.record.requires_human_review);
        assert_eq!(decision.record.weighted_score, 0.0);
    }

    #[test]
    fn test_reference_round_escalates_by_majority() {
        let decision = decide(&[
            make_opinion("ti", AgentRole::ThreatIntel, 0.9, "escalate"),
            make_opinion("logs", AgentRole::LogAnalyzer, 0.85, "escalate"),
            make_opinion("metrics", AgentRole::MetricsAnalyzer, 0.7, "monitor"),
        ]);
        assert_eq!(decision.consensus.kind, ConsensusKind::StrongMajority);
        assert!((decision.record.weighted_score - 3.775 / 4.5).abs() < 1e-9);
        assert_eq!(decision.record.state, DecisionState::Escalated);
        assert_eq!(decision.record.reason, DecisionReason::MajorityVote);
        assert!(!decision.record.requires_human_review);
        assert_eq!(decision.record.metadata["winning_label"], json!("escalate"));
    }

    #[test]
    fn test_unanimous_dead_zone_needs_human() {
        let decision = decide(&[
            make_opinion("a", AgentRole::MetricsAnalyzer, 0.8, "approve"),
            make_opinion("b", AgentRole::MetricsAnalyzer, 0.8, "approve"),
            make_opinion("c", AgentRole::MetricsAnalyzer, 0.8, "approve"),
        ]);
        assert_eq!(decision.consensus.kind, ConsensusKind::Unanimous);
        assert_eq!(decision.record.state, DecisionState::PendingHumanApproval);
        assert_eq!(decision.record.reason, DecisionReason::ConflictingOpinions);
        assert!(decision.record.requires_human_review);
    }

    #[test]
    fn test_unanimous_high_confidence_acts() {
        let decision = decide(&[
            make_opinion("a", AgentRole::PolicyChecker, 0.92, "approve"),
            make_opinion("b", AgentRole::LogAnalyzer, 0.9, "approve"),
        ]);
        assert_eq!(decision.record.state, DecisionState::Approved);
        assert_eq!(decision.record.reason, DecisionReason::UnanimousAgreement);
    }

    #[test]
    fn test_low_confidence_checked_before_anomaly() {
        let decision = decide(&[
            make_opinion("a", AgentRole::MetricsAnalyzer, 0.2, "escalate"),
            make_opinion("b", AgentRole::MetricsAnalyzer, 0.9, "escalate"),
        ]);
        assert!(decision.consensus.has_anomaly());
        assert_eq!(decision.record.reason, DecisionReason::LowConfidence);
    }

    #[test]
    fn test_anomaly_forces_review() {
        // aggregate (0.95*3 + 0.5*1) / 4 = 0.8375; the metrics agent diverges by 0.3375
        let decision = decide(&[
            make_opinion("human", AgentRole::HumanAnalyst, 0.95, "escalate"),
            make_opinion("metrics", AgentRole::MetricsAnalyzer, 0.5, "escalate"),
        ]);
        assert_eq!(decision.record.state, DecisionState::PendingHumanApproval);
        assert_eq!(decision.record.reason, DecisionReason::HallucinationDetected);
        assert_eq!(decision.record.metadata["anomalous_agents"], json!(["metrics"]));
    }

    #[test]
    fn test_single_opinion_is_expert_decision() {
        let decision = decide(&[make_opinion("ti", AgentRole::ThreatIntel, 0.95, "escalate")]);
        assert_eq!(decision.consensus.kind, ConsensusKind::SingleAgent);
        assert_eq!(decision.record.state, DecisionState::PendingHumanApproval);
        assert_eq!(decision.record.reason, DecisionReason::ExpertDecision);
    }

    #[test]
    fn test_split_is_conflicting() {
        let decision = decide(&[
            make_opinion("a", AgentRole::MetricsAnalyzer, 0.9, "escalate"),
            make_opinion("b", AgentRole::MetricsAnalyzer, 0.9, "approve"),
            make_opinion("c", AgentRole::MetricsAnalyzer, 0.9, "suppress"),
        ]);
        assert_eq!(decision.consensus.kind, ConsensusKind::Split);
        assert_eq!(decision.record.reason, DecisionReason::ConflictingOpinions);
    }

    #[test]
    fn test_invalid_opinion_aborts_round() {
        let mut bad = make_opinion("a", AgentRole::LogAnalyzer, 0.9, "escalate");
        bad.confidence = 1.4;
        let err = DecisionOrchestrator::default()
            .decide(&[bad], &[], &ConsensusContext::default())
            .unwrap_err();
        assert!(matches!(err, ValidationError::ConfidenceOutOfRange { .. }));
    }

    #[test]
    fn test_confidence_score_includes_evidence() {
        let evidence = vec![EvidenceItem::new("siem", 1.0, 1.0).unwrap()];
        let decision = DecisionOrchestrator::default()
            .decide(
                &[
                    make_opinion("a", AgentRole::LogAnalyzer, 0.8, "monitor"),
                    make_opinion("b", AgentRole::LogAnalyzer, 0.8, "monitor"),
                ],
                &evidence,
                &ConsensusContext::default(),
            )
            .unwrap();
        assert!((decision.record.weighted_score - 0.8).abs() < 1e-9);
        assert!((decision.record.confidence_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_majority_strategy_no_majority() {
        let orchestrator = DecisionOrchestrator::new(
            ConsensusEngine::default(),
            ConsensusStrategy::majority(0.6).unwrap(),
            ConfidencePolicy::default(),
        );
        let decision = orchestrator
            .decide(
                &[
                    make_opinion("a", AgentRole::MetricsAnalyzer, 0.9, "escalate"),
                    make_opinion("b", AgentRole::MetricsAnalyzer, 0.9, "monitor"),
                ],
                &[],
                &ConsensusContext::default(),
            )
            .unwrap();
        assert_eq!(decision.consensus.kind, ConsensusKind::NoMajority);
        assert_eq!(decision.record.state, DecisionState::PendingHumanApproval);
    }

    #[test]
    fn test_timed_out_record() {
        let record = DecisionOrchestrator::default().timed_out(1);
        assert_eq!(record.state, DecisionState::Investigating);
        assert!(record.requires_human_review);
        assert!(record.checkpoint_id.is_none());
        assert_eq!(record.metadata["timed_out"], json!(true));
    }

    #[test]
    fn test_thresholds_validated() {
        assert!(DecisionOrchestrator::default()
            .with_auto_thresholds(1.5, 0.8)
            .is_err());
        assert!(DecisionOrchestrator::from_config(&TriageConfig::default()).is_ok());
    }
}
