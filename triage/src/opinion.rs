//! Round inputs: evaluator roles, opinions, evidence, and the alert itself.
//!
//! Every constructor validates eagerly. Values that arrive through serde
//! (CLI input, replayed checkpoints) are re-checked with `validate()`
//! before they reach the consensus engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{check_confidence, ValidationError};

/// Weight of the human analyst role. Fixed for every deployment.
pub const HUMAN_ANALYST_WEIGHT: f64 = 3.0;

/// Evaluator role. Each role carries a static voting weight; new roles
/// are added as variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Threat intelligence correlation
    ThreatIntel,
    /// Log pattern analysis
    LogAnalyzer,
    /// Metrics / time-series anomaly analysis
    MetricsAnalyzer,
    /// Policy and compliance checks
    PolicyChecker,
    /// Human analyst opinion
    HumanAnalyst,
}

impl AgentRole {
    /// Static voting weight for this role.
    pub fn weight(&self) -> f64 {
        match self {
            AgentRole::ThreatIntel => 2.0,
            AgentRole::LogAnalyzer => 1.5,
            AgentRole::MetricsAnalyzer => 1.0,
            AgentRole::PolicyChecker => 1.5,
            AgentRole::HumanAnalyst => HUMAN_ANALYST_WEIGHT,
        }
    }

    /// Whether a security-flagged context boosts this role's weight.
    pub fn is_security_specialist(&self) -> bool {
        matches!(self, AgentRole::ThreatIntel)
    }

    /// All known roles.
    pub fn all() -> &'static [AgentRole] {
        &[
            AgentRole::ThreatIntel,
            AgentRole::LogAnalyzer,
            AgentRole::MetricsAnalyzer,
            AgentRole::PolicyChecker,
            AgentRole::HumanAnalyst,
        ]
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::ThreatIntel => write!(f, "threat_intel"),
            AgentRole::LogAnalyzer => write!(f, "log_analyzer"),
            AgentRole::MetricsAnalyzer => write!(f, "metrics_analyzer"),
            AgentRole::PolicyChecker => write!(f, "policy_checker"),
            AgentRole::HumanAnalyst => write!(f, "human_analyst"),
        }
    }
}

/// One evaluator's assessment for a decision round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOpinion {
    /// Evaluator identifier
    pub agent_id: String,
    /// Role (determines the base weight)
    pub role: AgentRole,
    /// Self-reported confidence (0.0–1.0)
    pub confidence: f64,
    /// Number of evidence items backing the opinion
    pub evidence_count: u32,
    /// Proposed outcome, e.g. "escalate", "monitor", "approve"
    pub result_label: String,
    /// Free-text rationale
    #[serde(default)]
    pub rationale: String,
    /// When the opinion was produced
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AgentOpinion {
    /// Create a validated opinion.
    pub fn new(
        agent_id: impl Into<String>,
        role: AgentRole,
        confidence: f64,
        evidence_count: u32,
        result_label: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let opinion = Self {
            agent_id: agent_id.into(),
            role,
            confidence,
            evidence_count,
            result_label: result_label.into(),
            rationale: rationale.into(),
            timestamp: Utc::now(),
        };
        opinion.validate()?;
        Ok(opinion)
    }

    /// Re-check invariants on a value that bypassed `new`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.agent_id.trim().is_empty() {
            return Err(ValidationError::EmptyAgentId);
        }
        if self.result_label.trim().is_empty() {
            return Err(ValidationError::EmptyLabel {
                agent_id: self.agent_id.clone(),
            });
        }
        check_confidence(&self.agent_id, self.confidence)?;
        Ok(())
    }

    /// Label used for grouping: trimmed and lowercased.
    pub fn normalized_label(&self) -> String {
        normalize_label(&self.result_label)
    }
}

/// Normalize a result label for comparison.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// A piece of supporting evidence with its own confidence and weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Where the evidence came from (log query, intel feed, ...)
    pub source: String,
    /// Confidence in this evidence (0.0–1.0)
    pub confidence: f64,
    /// Relative weight (> 0)
    pub weight: f64,
}

impl EvidenceItem {
    /// Create a validated evidence item.
    pub fn new(source: impl Into<String>, confidence: f64, weight: f64) -> Result<Self, ValidationError> {
        let item = Self {
            source: source.into(),
            confidence,
            weight,
        };
        item.validate()?;
        Ok(item)
    }

    /// Re-check invariants on a value that bypassed `new`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_confidence(&self.source, self.confidence)?;
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(ValidationError::NonPositiveWeight {
                subject: self.source.clone(),
                value: self.weight,
            });
        }
        Ok(())
    }
}

/// An incoming observability alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Identifier of the originating signal (alert rule, monitor, ...)
    pub source_id: String,
    /// Event type, e.g. "cpu_saturation"
    #[serde(default)]
    pub event_type: Option<String>,
    /// System that emitted the alert
    #[serde(default)]
    pub source_system: Option<String>,
    /// Reported severity
    #[serde(default)]
    pub severity: Option<String>,
    /// Short description
    #[serde(default)]
    pub summary: String,
    /// Whether the alert touches a security domain
    #[serde(default)]
    pub security_flagged: bool,
    /// Arbitrary attributes from the source
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// When the alert was received
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl AlertEvent {
    /// Create an alert with only a source id.
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            event_type: None,
            source_system: None,
            severity: None,
            summary: String::new(),
            security_flagged: false,
            attributes: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_source_system(mut self, system: impl Into<String>) -> Self {
        self.source_system = Some(system.into());
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Mark the alert as security-relevant.
    pub fn security(mut self) -> Self {
        self.security_flagged = true;
        self
    }

    /// Reject alerts that cannot be fingerprinted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_id.trim().is_empty() {
            return Err(ValidationError::EmptySourceId);
        }
        Ok(())
    }
}
