//! Evaluator agents and the registry the pipeline fans out to.
//!
//! The registry is an explicit value owned by the pipeline. Agents are
//! kept in registration order so rounds are reproducible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::ValidationError;
use crate::opinion::{AgentOpinion, AgentRole, AlertEvent};

/// Errors from evaluator agents and registration
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("evaluator {agent_id} failed: {reason}")]
    Failed { agent_id: String, reason: String },

    #[error("evaluator {0} is unavailable")]
    Unavailable(String),

    #[error("evaluator produced an invalid opinion: {0}")]
    InvalidOpinion(#[from] ValidationError),

    #[error("an evaluator with id {0} is already registered")]
    DuplicateAgent(String),
}

/// Something that turns an alert into an opinion: a model call, a rule
/// engine, a human queue.
#[async_trait]
pub trait EvaluatorAgent: Send + Sync {
    fn agent_id(&self) -> &str;

    fn role(&self) -> AgentRole;

    async fn evaluate(&self, alert: &AlertEvent) -> Result<AgentOpinion, EvaluatorError>;
}

pub type SharedAgent = Arc<dyn EvaluatorAgent>;

/// Registered evaluators, in registration order, unique by id.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<SharedAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: SharedAgent) -> Result<(), EvaluatorError> {
        if self.get(agent.agent_id()).is_some() {
            return Err(EvaluatorError::DuplicateAgent(agent.agent_id().to_string()));
        }
        self.agents.push(agent);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_agent(mut self, agent: SharedAgent) -> Result<Self, EvaluatorError> {
        self.register(agent)?;
        Ok(self)
    }

    pub fn unregister(&mut self, agent_id: &str) -> Option<SharedAgent> {
        let position = self.agents.iter().position(|a| a.agent_id() == agent_id)?;
        Some(self.agents.remove(position))
    }

    pub fn get(&self, agent_id: &str) -> Option<&SharedAgent> {
        self.agents.iter().find(|a| a.agent_id() == agent_id)
    }

    pub fn agents(&self) -> &[SharedAgent] {
        &self.agents
    }

    pub fn by_role(&self, role: AgentRole) -> impl Iterator<Item = &SharedAgent> {
        self.agents.iter().filter(move |a| a.role() == role)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.agents.iter().map(|a| a.agent_id()).collect();
        f.debug_struct("AgentRegistry").field("agents", &ids).finish()
    }
}

/// Evaluator that always returns the same opinion, optionally after a
/// delay or as a failure. Used for replaying recorded rounds.
#[derive(Debug, Clone)]
pub struct FixedOpinionAgent {
    template: AgentOpinion,
    delay: Duration,
    failure: Option<String>,
}

impl FixedOpinionAgent {
    pub fn new(
        agent_id: impl Into<String>,
        role: AgentRole,
        confidence: f64,
        label: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self::from_opinion(AgentOpinion::new(
            agent_id,
            role,
            confidence,
            1,
            label,
            "",
        )?))
    }

    /// Replay a recorded opinion.
    pub fn from_opinion(opinion: AgentOpinion) -> Self {
        Self {
            template: opinion,
            delay: Duration::ZERO,
            failure: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_evidence_count(mut self, count: u32) -> Self {
        self.template.evidence_count = count;
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.template.rationale = rationale.into();
        self
    }

    /// Make every evaluation fail with `reason`.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn shared(self) -> SharedAgent {
        Arc::new(self)
    }
}

#[async_trait]
impl EvaluatorAgent for FixedOpinionAgent {
    fn agent_id(&self) -> &str {
        &self.template.agent_id
    }

    fn role(&self) -> AgentRole {
        self.template.role
    }

    async fn evaluate(&self, _alert: &AlertEvent) -> Result<AgentOpinion, EvaluatorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(EvaluatorError::Failed {
                agent_id: self.template.agent_id.clone(),
                reason: reason.clone(),
            });
        }
        Ok(AgentOpinion {
            timestamp: Utc::now(),
            ..self.template.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_agent(id: &str, role: AgentRole) -> SharedAgent {
        FixedOpinionAgent::new(id, role, 0.8, "escalate").unwrap().shared()
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = AgentRegistry::new();
        registry.register(make_agent("ti", AgentRole::ThreatIntel)).unwrap();
        registry.register(make_agent("logs", AgentRole::LogAnalyzer)).unwrap();

        let err = registry
            .register(make_agent("ti", AgentRole::PolicyChecker))
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::DuplicateAgent(id) if id == "ti"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_order_lookup_and_unregister() {
        let mut registry = AgentRegistry::new()
            .with_agent(make_agent("a", AgentRole::MetricsAnalyzer))
            .unwrap()
            .with_agent(make_agent("b", AgentRole::ThreatIntel))
            .unwrap()
            .with_agent(make_agent("c", AgentRole::MetricsAnalyzer))
            .unwrap();

        let ids: Vec<&str> = registry.agents().iter().map(|a| a.agent_id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(registry.by_role(AgentRole::MetricsAnalyzer).count(), 2);

        assert!(registry.unregister("b").is_some());
        assert!(registry.get("b").is_none());
        assert!(registry.unregister("b").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_fixed_agent_validates() {
        assert!(FixedOpinionAgent::new("x", AgentRole::LogAnalyzer, 1.5, "escalate").is_err());
        assert!(FixedOpinionAgent::new("", AgentRole::LogAnalyzer, 0.5, "escalate").is_err());
    }

    #[tokio::test]
    async fn test_fixed_agent_evaluate() {
        let alert = AlertEvent::new("rule-1");
        let agent = FixedOpinionAgent::new("ti", AgentRole::ThreatIntel, 0.9, "escalate")
            .unwrap()
            .with_evidence_count(4);
        let opinion = agent.evaluate(&alert).await.unwrap();
        assert_eq!(opinion.agent_id, "ti");
        assert_eq!(opinion.evidence_count, 4);
        assert_eq!(opinion.result_label, "escalate");

        let failing = agent.clone().failing("model timeout");
        assert!(matches!(
            failing.evaluate(&alert).await,
            Err(EvaluatorError::Failed { .. })
        ));
    }
}
