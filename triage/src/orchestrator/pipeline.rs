//! Triage pipeline — one concurrent round per alert
//!
//! ```text
//! AlertEvent ─► Deduplicator.check ─┬─ Skip ──────────────► (nothing)
//!                                   ├─ UpdateExisting ────► append duplicate step to original thread
//!                                   └─ New
//!                                       │
//!                    fan out to every registered agent (per-agent timeout)
//!                                       │  barrier: all resolved or timed out
//!                                       ▼
//!                 Consensus ─► Confidence ─► DecisionOrchestrator
//!                                       │
//!                       best-effort checkpoint (retried, soft failure)
//! ```
//!
//! The whole collect-and-decide stage runs under the round timeout. A
//! round that exceeds it resolves to `Investigating` and writes no step.
//! A round that times out or is rejected forgets its dedup entry, so the
//! next occurrence of the alert is triaged afresh.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::decision::{Decision, DecisionOrchestrator};
use super::registry::{AgentRegistry, EvaluatorError};
use super::state::{DecisionRecord, GovernanceError, HumanValidation};
use crate::checkpoint::{CheckpointEngine, StepPayload};
use crate::config::TriageConfig;
use crate::confidence::ConfidenceAssessment;
use crate::consensus::{ConsensusContext, ConsensusOutcome};
use crate::dedup::{DedupAction, DedupDecision, Deduplicator, EventFingerprint};
use crate::error::{ConfigError, ValidationError};
use crate::opinion::{AgentOpinion, AlertEvent, EvidenceItem};

/// Default per-agent opinion timeout.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default whole-round timeout.
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors fatal to one round. Infrastructure failures never end up here.
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("invalid round input: {0}")]
    Validation(#[from] ValidationError),

    #[error("evaluator {agent_id} returned an invalid opinion: {source}")]
    InvalidOpinion {
        agent_id: String,
        #[source]
        source: ValidationError,
    },
}

/// How a round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// New round, decision derived
    Decided,
    /// New round, overall timeout hit before a decision
    TimedOut,
    /// Repeat of a live execution; recorded on its thread
    Duplicate,
    /// Another process holds the creation lock for this key
    Skipped,
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decided => write!(f, "decided"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Everything a round produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub status: RoundStatus,
    /// Execution id of the thread this event belongs to
    pub thread_id: Option<String>,
    pub dedup: DedupDecision,
    pub record: Option<DecisionRecord>,
    pub consensus: Option<ConsensusOutcome>,
    pub assessment: Option<ConfidenceAssessment>,
    /// Agents that timed out or failed and were left out of the round
    pub excluded_agents: Vec<String>,
    /// Checkpoint written for this event, if persistence succeeded
    pub checkpoint_id: Option<String>,
}

impl RoundOutcome {
    fn without_decision(status: RoundStatus, dedup: DedupDecision) -> Self {
        Self {
            status,
            thread_id: dedup.execution_id.clone(),
            dedup,
            record: None,
            consensus: None,
            assessment: None,
            excluded_agents: Vec::new(),
            checkpoint_id: None,
        }
    }
}

/// Opinions collected in one round.
struct Collected {
    opinions: Vec<AgentOpinion>,
    excluded: Vec<String>,
}

/// Runs triage rounds.
///
/// Cheap to clone; clones share the deduplicator, registry and checkpoint
/// store, so one pipeline can serve many concurrent rounds.
#[derive(Clone)]
pub struct TriagePipeline {
    dedup: Arc<dyn Deduplicator>,
    registry: Arc<AgentRegistry>,
    orchestrator: DecisionOrchestrator,
    checkpoints: CheckpointEngine,
    agent_timeout: Duration,
    round_timeout: Duration,
    keep_last: Option<usize>,
}

impl TriagePipeline {
    pub fn new(
        dedup: Arc<dyn Deduplicator>,
        registry: AgentRegistry,
        orchestrator: DecisionOrchestrator,
        checkpoints: CheckpointEngine,
    ) -> Self {
        Self {
            dedup,
            registry: Arc::new(registry),
            orchestrator,
            checkpoints,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            keep_last: None,
        }
    }

    /// Local dedup and in-memory checkpoints, parameterized by `config`.
    pub fn from_config(config: &TriageConfig, registry: AgentRegistry) -> Result<Self, ConfigError> {
        config.validate()?;
        let dedup = config.dedup.build_local()?;
        let checkpoints = CheckpointEngine::new(
            Arc::new(crate::checkpoint::InMemoryCheckpointStore::new()),
            config.checkpoint.retry.clone(),
        );
        Ok(Self::new(
            Arc::new(dedup),
            registry,
            DecisionOrchestrator::from_config(config)?,
            checkpoints,
        )
        .with_timeouts(config.round.agent_timeout(), config.round.round_timeout())?
        .with_retention(config.checkpoint.keep_last))
    }

    pub fn with_timeouts(mut self, agent: Duration, round: Duration) -> Result<Self, ConfigError> {
        if agent.is_zero() || round.is_zero() {
            return Err(ConfigError::Invalid {
                name: "round",
                reason: "timeouts must be non-zero".to_string(),
            });
        }
        self.agent_timeout = agent;
        self.round_timeout = round;
        Ok(self)
    }

    /// Prune each thread to its newest `keep_last` steps after a write.
    pub fn with_retention(mut self, keep_last: usize) -> Self {
        self.keep_last = Some(keep_last.max(1));
        self
    }

    pub fn checkpoints(&self) -> &CheckpointEngine {
        &self.checkpoints
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &DecisionOrchestrator {
        &self.orchestrator
    }

    /// Triage one alert.
    pub async fn run(&self, alert: &AlertEvent, evidence: &[EvidenceItem]) -> Result<RoundOutcome, RoundError> {
        alert.validate()?;
        for item in evidence {
            item.validate()?;
        }

        let dedup = self.dedup.check(&EventFingerprint::from(alert)).await;
        let thread_id = match (dedup.action, dedup.execution_id.clone()) {
            (DedupAction::Skip, _) => {
                debug!(key = %dedup.key, "Round already starting elsewhere, skipping");
                return Ok(RoundOutcome::without_decision(RoundStatus::Skipped, dedup));
            }
            (DedupAction::UpdateExisting, Some(thread_id)) => {
                return Ok(self.record_duplicate(alert, thread_id, dedup).await);
            }
            (_, Some(thread_id)) => thread_id,
            (_, None) => uuid::Uuid::new_v4().to_string(),
        };

        let context = ConsensusContext {
            security_flagged: alert.security_flagged,
            ..ConsensusContext::default()
        };

        let progress = Arc::new(AtomicUsize::new(0));
        let round = self.collect_and_decide(alert, evidence, &context, progress.clone());

        let (decision, collected) = match tokio::time::timeout(self.round_timeout, round).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.dedup.forget(&dedup.key).await;
                return Err(e);
            }
            Err(_) => {
                self.dedup.forget(&dedup.key).await;
                let finished = progress.load(Ordering::SeqCst);
                warn!(
                    thread_id = %thread_id,
                    timeout_ms = u64::try_from(self.round_timeout.as_millis()).unwrap_or(u64::MAX),
                    finished,
                    "Round timed out, resolving to investigating"
                );
                let mut outcome = RoundOutcome::without_decision(RoundStatus::TimedOut, dedup);
                outcome.thread_id = Some(thread_id);
                outcome.record = Some(self.orchestrator.timed_out(finished));
                return Ok(outcome);
            }
        };

        let Decision {
            mut record,
            consensus,
            assessment,
        } = decision;

        let payload = StepPayload::new(json!({
            "event": "decision",
            "record": &record,
        }))
        .with_agent_memory(json!({ "opinions": &collected.opinions }))
        .with_decision_context(json!({
            "alert": alert,
            "evidence": evidence,
            "consensus": &consensus,
            "assessment": &assessment,
            "excluded_agents": &collected.excluded,
        }));

        let checkpoint_id = self.persist(&thread_id, payload).await;
        record.checkpoint_id = checkpoint_id.clone();

        Ok(RoundOutcome {
            status: RoundStatus::Decided,
            thread_id: Some(thread_id),
            dedup,
            record: Some(record),
            consensus: Some(consensus),
            assessment: Some(assessment),
            excluded_agents: collected.excluded,
            checkpoint_id,
        })
    }

    /// Triage several alerts as independent concurrent rounds.
    pub async fn run_many(
        &self,
        alerts: &[(AlertEvent, Vec<EvidenceItem>)],
    ) -> Vec<Result<RoundOutcome, RoundError>> {
        join_all(alerts.iter().map(|(alert, evidence)| self.run(alert, evidence))).await
    }

    /// Attach a human validation to `record` and log it on its thread.
    ///
    /// Returns the checkpoint id of the validation step, if it was written.
    pub async fn record_validation(
        &self,
        thread_id: &str,
        record: &mut DecisionRecord,
        validation: HumanValidation,
    ) -> Result<Option<String>, GovernanceError> {
        record.apply_validation(validation)?;
        info!(
            thread_id,
            decision_id = %record.id,
            approved = record.validation.as_ref().map(|v| v.approved),
            "Human validation recorded"
        );
        let payload = StepPayload::new(json!({
            "event": "human_validation",
            "decision_id": &record.id,
            "validation": &record.validation,
        }));
        Ok(self.persist(thread_id, payload).await)
    }

    async fn collect_and_decide(
        &self,
        alert: &AlertEvent,
        evidence: &[EvidenceItem],
        context: &ConsensusContext,
        progress: Arc<AtomicUsize>,
    ) -> Result<(Decision, Collected), RoundError> {
        let collected = self.collect_opinions(alert, progress).await?;
        let decision = self
            .orchestrator
            .decide(&collected.opinions, evidence, context)?;
        Ok((decision, collected))
    }

    /// Fan out to every agent; returns once each has answered, failed or
    /// timed out. Only a malformed opinion is an error.
    async fn collect_opinions(
        &self,
        alert: &AlertEvent,
        progress: Arc<AtomicUsize>,
    ) -> Result<Collected, RoundError> {
        let calls = self.registry.agents().iter().map(|agent| {
            let progress = progress.clone();
            async move {
                let result = tokio::time::timeout(self.agent_timeout, agent.evaluate(alert)).await;
                progress.fetch_add(1, Ordering::SeqCst);
                (agent.agent_id().to_string(), result)
            }
        });

        let mut collected = Collected {
            opinions: Vec::new(),
            excluded: Vec::new(),
        };

        for (agent_id, result) in join_all(calls).await {
            match result {
                Ok(Ok(opinion)) => {
                    opinion.validate().map_err(|source| RoundError::InvalidOpinion {
                        agent_id: agent_id.clone(),
                        source,
                    })?;
                    collected.opinions.push(opinion);
                }
                Ok(Err(EvaluatorError::InvalidOpinion(source))) => {
                    return Err(RoundError::InvalidOpinion { agent_id, source });
                }
                Ok(Err(e)) => {
                    warn!(agent_id = %agent_id, error = %e, "Evaluator failed, excluding from round");
                    collected.excluded.push(agent_id);
                }
                Err(_) => {
                    warn!(
                        agent_id = %agent_id,
                        timeout_ms = u64::try_from(self.agent_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Evaluator timed out, excluding from round"
                    );
                    collected.excluded.push(agent_id);
                }
            }
        }

        Ok(collected)
    }

    async fn record_duplicate(&self, alert: &AlertEvent, thread_id: String, dedup: DedupDecision) -> RoundOutcome {
        let payload = StepPayload::new(json!({
            "event": "duplicate_occurrence",
            "occurrence_count": dedup.occurrence_count,
            "source_id": &alert.source_id,
            "received_at": alert.received_at,
        }));
        let checkpoint_id = self.persist(&thread_id, payload).await;

        debug!(
            thread_id = %thread_id,
            occurrences = dedup.occurrence_count,
            "Duplicate recorded on existing thread"
        );

        let mut outcome = RoundOutcome::without_decision(RoundStatus::Duplicate, dedup);
        outcome.checkpoint_id = checkpoint_id;
        outcome
    }

    /// Append the next step of `thread_id`. Failures are logged, not raised.
    async fn persist(&self, thread_id: &str, payload: StepPayload) -> Option<String> {
        match self.checkpoints.append_next(thread_id, payload).await {
            Ok((step_index, id)) => {
                debug!(thread_id, step_index, "Step appended");
                if let Some(keep_last) = self.keep_last {
                    if let Err(e) = self.checkpoints.cleanup_old(thread_id, keep_last).await {
                        warn!(thread_id, error = %e, "Checkpoint retention failed");
                    }
                }
                Some(id)
            }
            Err(e) => {
                warn!(
                    thread_id,
                    error = %e,
                    "Checkpoint persistence failed, continuing without checkpoint"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for TriagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriagePipeline")
            .field("dedup", &self.dedup.backend())
            .field("registry", &self.registry)
            .field("checkpoints", &self.checkpoints)
            .field("agent_timeout", &self.agent_timeout)
            .field("round_timeout", &self.round_timeout)
            .field("keep_last", &self.keep_last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::LocalDeduplicator;
    use crate::opinion::AgentRole;
    use crate::orchestrator::registry::FixedOpinionAgent;
    use crate::orchestrator::state::DecisionState;

    fn make_pipeline(agents: Vec<FixedOpinionAgent>) -> TriagePipeline {
        let mut registry = AgentRegistry::new();
        for agent in agents {
            registry.register(agent.shared()).unwrap();
        }
        TriagePipeline::new(
            Arc::new(LocalDeduplicator::default()),
            registry,
            DecisionOrchestrator::default(),
            CheckpointEngine::in_memory(),
        )
    }

    fn agent(id: &str, role: AgentRole, confidence: f64, label: &str) -> FixedOpinionAgent {
        FixedOpinionAgent::new(id, role, confidence, label).unwrap()
    }

    #[tokio::test]
    async fn test_new_round_decides_and_checkpoints() {
        let pipeline = make_pipeline(vec![
            agent("ti", AgentRole::ThreatIntel, 0.9, "escalate"),
            agent("logs", AgentRole::LogAnalyzer, 0.85, "escalate"),
        ]);
        let outcome = pipeline.run(&AlertEvent::new("rule-1"), &[]).await.unwrap();

        assert_eq!(outcome.status, RoundStatus::Decided);
        let record = outcome.record.unwrap();
        assert_eq!(record.state, DecisionState::Escalated);
        assert_eq!(record.checkpoint_id, outcome.checkpoint_id);

        let thread_id = outcome.thread_id.unwrap();
        let step = pipeline.checkpoints().load_step(&thread_id, 0).await.unwrap().unwrap();
        assert_eq!(Some(step.id), record.checkpoint_id);
        assert_eq!(step.state_blob["event"], "decision");
    }

    #[tokio::test]
    async fn test_duplicate_appends_step_to_original_thread() {
        let pipeline = make_pipeline(vec![agent("ti", AgentRole::ThreatIntel, 0.9, "escalate")]);
        let alert = AlertEvent::new("rule-1").with_severity("high");

        let first = pipeline.run(&alert, &[]).await.unwrap();
        let second = pipeline.run(&alert, &[]).await.unwrap();

        assert_eq!(second.status, RoundStatus::Duplicate);
        assert_eq!(second.thread_id, first.thread_id);
        assert!(second.record.is_none());

        let steps = pipeline
            .checkpoints()
            .list_steps(first.thread_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].state_blob["event"], "duplicate_occurrence");
        assert_eq!(steps[1].state_blob["occurrence_count"], 2);
    }

    #[tokio::test]
    async fn test_failed_agent_excluded() {
        let pipeline = make_pipeline(vec![
            agent("ti", AgentRole::ThreatIntel, 0.9, "escalate"),
            agent("broken", AgentRole::LogAnalyzer, 0.9, "escalate").failing("model offline"),
        ]);
        let outcome = pipeline.run(&AlertEvent::new("rule-1"), &[]).await.unwrap();
        assert_eq!(outcome.excluded_agents, vec!["broken".to_string()]);
        assert_eq!(outcome.consensus.unwrap().per_agent.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_alert_rejected() {
        let pipeline = make_pipeline(vec![]);
        let err = pipeline.run(&AlertEvent::new("  "), &[]).await.unwrap_err();
        assert!(matches!(err, RoundError::Validation(ValidationError::EmptySourceId)));
    }

    #[tokio::test]
    async fn test_record_validation_appends_step() {
        let pipeline = make_pipeline(vec![agent("ti", AgentRole::ThreatIntel, 0.6, "escalate")]);
        let outcome = pipeline.run(&AlertEvent::new("rule-1"), &[]).await.unwrap();
        let thread_id = outcome.thread_id.unwrap();
        let mut record = outcome.record.unwrap();
        assert!(record.requires_human_review);

        let validation = HumanValidation::new(record.id.clone(), true, "analyst-7");
        let checkpoint = pipeline
            .record_validation(&thread_id, &mut record, validation.clone())
            .await
            .unwrap();
        assert!(checkpoint.is_some());
        assert!(record.is_validated());

        assert!(pipeline
            .record_validation(&thread_id, &mut record, validation)
            .await
            .is_err());
        assert_eq!(pipeline.checkpoints().list_steps(&thread_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retention_applied() {
        let pipeline = make_pipeline(vec![agent("ti", AgentRole::ThreatIntel, 0.9, "escalate")])
            .with_retention(2);
        let alert = AlertEvent::new("rule-1");
        let first = pipeline.run(&alert, &[]).await.unwrap();
        for _ in 0..4 {
            pipeline.run(&alert, &[]).await.unwrap();
        }
        let steps = pipeline
            .checkpoints()
            .list_steps(first.thread_id.as_deref().unwrap())
            .await
            .unwrap();
        let indices: Vec<u64> = steps.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![3, 4]);
    }
}
