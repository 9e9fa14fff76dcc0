//! Weighted consensus over evaluator opinions.
//!
//! `aggregate = Σ(confidence·weight) / Σ(weight)`, with role weights from
//! the static table scaled by the round context. Agreement is measured
//! by weight share of the winning label. Never fails: degenerate input
//! produces a zero-score outcome that requires review.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::strategy::ConsensusStrategy;
use crate::error::ConfigError;
use crate::opinion::{AgentOpinion, AgentRole};

/// Aggregate score below which a round needs human review.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Per-opinion divergence from the aggregate that gets flagged.
pub const DEFAULT_ANOMALY_DIVERGENCE: f64 = 0.2;

/// Weight multiplier for security specialists in a security-flagged round.
pub const DEFAULT_SECURITY_MULTIPLIER: f64 = 1.5;

/// Weight share of the winning label for a strong majority.
pub const STRONG_MAJORITY_RATIO: f64 = 0.75;

/// Weight share of the winning label for a simple majority.
pub const MAJORITY_RATIO: f64 = 0.5;

const WEIGHT_EPSILON: f64 = 1e-9;

/// Qualitative agreement among a round's opinions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusKind {
    /// No opinions at all
    Empty,
    /// Exactly one opinion
    SingleAgent,
    /// Every opinion carries the same label
    Unanimous,
    /// Winning label holds at least 75% of the weight
    StrongMajority,
    /// Winning label holds at least 50% of the weight
    Majority,
    /// No label reaches half of the weight
    Split,
    /// Majority strategy: winning label below the configured threshold
    NoMajority,
}

impl ConsensusKind {
    /// Majority-like agreement that may auto-decide.
    pub fn is_majority(&self) -> bool {
        matches!(self, ConsensusKind::StrongMajority | ConsensusKind::Majority)
    }
}

impl std::fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::SingleAgent => write!(f, "single_agent"),
            Self::Unanimous => write!(f, "unanimous"),
            Self::StrongMajority => write!(f, "strong_majority"),
            Self::Majority => write!(f, "majority"),
            Self::Split => write!(f, "split"),
            Self::NoMajority => write!(f, "no_majority"),
        }
    }
}

/// Scaling applied to role weights for one round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusContext {
    /// Security-flagged rounds boost security specialists
    #[serde(default)]
    pub security_flagged: bool,
    /// Extra per-role multipliers (must be positive to take effect)
    #[serde(default)]
    pub role_multipliers: BTreeMap<AgentRole, f64>,
}

impl ConsensusContext {
    /// Context for a security-flagged round.
    pub fn security() -> Self {
        Self {
            security_flagged: true,
            role_multipliers: BTreeMap::new(),
        }
    }

    /// Add a per-role multiplier.
    pub fn with_multiplier(mut self, role: AgentRole, multiplier: f64) -> Self {
        self.role_multipliers.insert(role, multiplier);
        self
    }
}

/// Weighted contribution of one opinion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScore {
    pub agent_id: String,
    pub role: AgentRole,
    /// Effective weight after context scaling
    pub weight: f64,
    pub confidence: f64,
    /// confidence × weight
    pub weighted_score: f64,
    /// |confidence − aggregate|
    pub divergence: f64,
}

/// Result of a consensus calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    /// Weighted mean confidence (0.0–1.0)
    pub aggregate_score: f64,
    /// Agreement classification
    pub kind: ConsensusKind,
    /// Per-agent weighted contributions, in input order
    pub per_agent: Vec<AgentScore>,
    /// Whether the round must go to a human
    pub requires_human_review: bool,
    /// Informational divergence note
    pub anomaly_note: Option<String>,
    /// Agents whose confidence diverged from the aggregate
    pub anomalous_agents: Vec<String>,
    /// Label chosen by weighted tie-break
    pub winning_label: Option<String>,
    /// Weight share of the winning label (0.0–1.0)
    pub agreement_ratio: f64,
    /// Σ weight
    pub total_weight: f64,
}

impl ConsensusOutcome {
    /// Safe outcome for an empty round.
    pub fn empty() -> Self {
        Self {
            aggregate_score: 0.0,
            kind: ConsensusKind::Empty,
            per_agent: Vec::new(),
            requires_human_review: true,
            anomaly_note: None,
            anomalous_agents: Vec::new(),
            winning_label: None,
            agreement_ratio: 0.0,
            total_weight: 0.0,
        }
    }

    /// Safe outcome for input the engine cannot score.
    pub fn degenerate(note: impl Into<String>) -> Self {
        Self {
            kind: ConsensusKind::Split,
            anomaly_note: Some(note.into()),
            ..Self::empty()
        }
    }

    /// Whether the divergence check flagged anything.
    pub fn has_anomaly(&self) -> bool {
        self.anomaly_note.is_some()
    }
}

/// Per-label weight tally.
#[derive(Debug, Clone, PartialEq)]
struct LabelTally {
    label: String,
    weight: f64,
    /// (weight, confidence) of the strongest single opinion for this label
    top_opinion: (f64, f64),
}

/// Weighted consensus engine.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    threshold: f64,
    anomaly_divergence: f64,
    security_multiplier: f64,
}

impl ConsensusEngine {
    /// Create an engine with the given review threshold.
    pub fn new(threshold: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            threshold: ConfigError::check_unit("consensus.threshold", threshold)?,
            anomaly_divergence: DEFAULT_ANOMALY_DIVERGENCE,
            security_multiplier: DEFAULT_SECURITY_MULTIPLIER,
        })
    }

    /// Override the divergence that counts as anomalous.
    pub fn with_anomaly_divergence(mut self, divergence: f64) -> Result<Self, ConfigError> {
        self.anomaly_divergence = ConfigError::check_unit("consensus.anomaly_divergence", divergence)?;
        Ok(self)
    }

    /// Override the security-flagged weight multiplier.
    pub fn with_security_multiplier(mut self, multiplier: f64) -> Result<Self, ConfigError> {
        self.security_multiplier =
            ConfigError::check_positive("consensus.security_multiplier", multiplier)?;
        Ok(self)
    }

    /// Review threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Effective weight of `role` under `context`.
    pub fn weight_for(&self, role: AgentRole, context: &ConsensusContext) -> f64 {
        let mut weight = role.weight();
        if context.security_flagged && role.is_security_specialist() {
            weight *= self.security_multiplier;
        }
        if let Some(&multiplier) = context.role_multipliers.get(&role) {
            if multiplier.is_finite() && multiplier > 0.0 {
                weight *= multiplier;
            } else {
                warn!(%role, multiplier, "Ignoring non-positive role multiplier");
            }
        }
        weight
    }

    /// Evaluate `opinions` under a specific strategy.
    pub fn evaluate(
        &self,
        strategy: &ConsensusStrategy,
        opinions: &[AgentOpinion],
        context: &ConsensusContext,
    ) -> ConsensusOutcome {
        let outcome = self.calculate(opinions, context);
        strategy.apply(outcome)
    }

    /// Weighted consensus over `opinions`.
    pub fn calculate(
        &self,
        opinions: &[AgentOpinion],
        context: &ConsensusContext,
    ) -> ConsensusOutcome {
        if opinions.is_empty() {
            debug!("No opinions, returning empty consensus");
            return ConsensusOutcome::empty();
        }

        if let Some(bad) = opinions.iter().find(|o| o.validate().is_err()) {
            warn!(agent_id = %bad.agent_id, "Unscoreable opinion in consensus input");
            return ConsensusOutcome::degenerate(format!(
                "unscoreable opinion from {}",
                bad.agent_id
            ));
        }

        let weights: Vec<f64> = opinions
            .iter()
            .map(|o| self.weight_for(o.role, context))
            .collect();
        let total_weight: f64 = weights.iter().sum();
        let weighted_sum: f64 = opinions
            .iter()
            .zip(&weights)
            .map(|(o, w)| o.confidence * w)
            .sum();

        if total_weight <= 0.0 || !total_weight.is_finite() || !weighted_sum.is_finite() {
            return ConsensusOutcome::degenerate("total weight is not positive");
        }

        let aggregate_score = (weighted_sum / total_weight).clamp(0.0, 1.0);

        let per_agent: Vec<AgentScore> = opinions
            .iter()
            .zip(&weights)
            .map(|(o, &w)| AgentScore {
                agent_id: o.agent_id.clone(),
                role: o.role,
                weight: w,
                confidence: o.confidence,
                weighted_score: o.confidence * w,
                divergence: (o.confidence - aggregate_score).abs(),
            })
            .collect();

        let anomalous_agents: Vec<String> = per_agent
            .iter()
            .filter(|s| s.divergence > self.anomaly_divergence)
            .map(|s| s.agent_id.clone())
            .collect();
        let anomaly_note = if anomalous_agents.is_empty() {
            None
        } else {
            let detail: Vec<String> = per_agent
                .iter()
                .filter(|s| s.divergence > self.anomaly_divergence)
                .map(|s| format!("{} ({:.3})", s.agent_id, s.divergence))
                .collect();
            Some(format!(
                "confidence diverges more than {:.2} from aggregate {:.3}: {}",
                self.anomaly_divergence,
                aggregate_score,
                detail.join(", ")
            ))
        };
        if let Some(ref note) = anomaly_note {
            info!(agents = ?anomalous_agents, "Consensus anomaly: {}", note);
        }

        let tallies = Self::tally(opinions, &weights);
        let winning_label = Self::pick_winner(&tallies);
        let winning_weight = winning_label
            .as_ref()
            .and_then(|label| tallies.iter().find(|t| &t.label == label))
            .map(|t| t.weight)
            .unwrap_or(0.0);
        let agreement_ratio = (winning_weight / total_weight).clamp(0.0, 1.0);

        let kind = if opinions.len() == 1 {
            ConsensusKind::SingleAgent
        } else if tallies.len() == 1 {
            ConsensusKind::Unanimous
        } else if agreement_ratio >= STRONG_MAJORITY_RATIO {
            ConsensusKind::StrongMajority
        } else if agreement_ratio >= MAJORITY_RATIO {
            ConsensusKind::Majority
        } else {
            ConsensusKind::Split
        };

        debug!(
            aggregate_score,
            %kind,
            agreement_ratio,
            opinions = opinions.len(),
            "Consensus calculated"
        );

        ConsensusOutcome {
            aggregate_score,
            kind,
            per_agent,
            requires_human_review: aggregate_score < self.threshold,
            anomaly_note,
            anomalous_agents,
            winning_label,
            agreement_ratio,
            total_weight,
        }
    }

    /// Weighted tie-break: the label with the highest total weight wins;
    /// equal totals go to the label of the single strongest opinion.
    pub fn resolve_tie(
        &self,
        opinions: &[AgentOpinion],
        context: &ConsensusContext,
    ) -> Option<String> {
        let weights: Vec<f64> = opinions
            .iter()
            .map(|o| self.weight_for(o.role, context))
            .collect();
        Self::pick_winner(&Self::tally(opinions, &weights))
    }

    fn tally(opinions: &[AgentOpinion], weights: &[f64]) -> Vec<LabelTally> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut tallies: Vec<LabelTally> = Vec::new();

        for (opinion, &weight) in opinions.iter().zip(weights) {
            let label = opinion.normalized_label();
            let slot = *index.entry(label.clone()).or_insert_with(|| {
                tallies.push(LabelTally {
                    label,
                    weight: 0.0,
                    top_opinion: (0.0, 0.0),
                });
                tallies.len() - 1
            });
            let tally = &mut tallies[slot];
            tally.weight += weight;
            if (weight, opinion.confidence) > tally.top_opinion {
                tally.top_opinion = (weight, opinion.confidence);
            }
        }

        tallies
    }

    fn pick_winner(tallies: &[LabelTally]) -> Option<String> {
        let max_weight = tallies.iter().map(|t| t.weight).fold(f64::MIN, f64::max);

        tallies
            .iter()
            .filter(|t| (t.weight - max_weight).abs() < WEIGHT_EPSILON)
            .max_by(|a, b| {
                a.top_opinion
                    .partial_cmp(&b.top_opinion)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Deterministic final fallback: alphabetically first label wins
                    .then_with(|| b.label.cmp(&a.label))
            })
            .map(|t| t.label.clone())
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            anomaly_divergence: DEFAULT_ANOMALY_DIVERGENCE,
            security_multiplier: DEFAULT_SECURITY_MULTIPLIER,
        }
    }
}
