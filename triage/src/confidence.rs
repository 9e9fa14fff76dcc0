//! Confidence policy — blends a reported confidence with supporting
//! evidence into a governed score and flags suspicious divergence.
//!
//! ```text
//! evidence_contribution = weighted_avg(evidence.confidence, evidence.weight) × 0.1
//! final                 = min(1.0, reported × base_weight + evidence_contribution)
//! divergence            = |reported − final|
//!   < 0.2 none │ [0.2, 0.3) potential │ ≥ 0.3 likely
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{check_confidence, ConfigError, ValidationError};
use crate::opinion::EvidenceItem;

/// Fixed scale applied to the evidence average.
pub const EVIDENCE_FACTOR: f64 = 0.1;

/// Divergence at which an anomaly becomes possible.
pub const POTENTIAL_DIVERGENCE: f64 = 0.2;

/// Divergence at which an anomaly is likely.
pub const LIKELY_DIVERGENCE: f64 = 0.3;

/// Reported confidence below which an unsupported claim is rejected.
pub const UNSUPPORTED_MIN_CONFIDENCE: f64 = 0.5;

/// Coarse band for a final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    /// Band a score: <0.2 very low, <0.4 low, <0.6 medium, <0.8 high.
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            ConfidenceLevel::VeryLow
        } else if score < 0.4 {
            ConfidenceLevel::Low
        } else if score < 0.6 {
            ConfidenceLevel::Medium
        } else if score < 0.8 {
            ConfidenceLevel::High
        } else {
            ConfidenceLevel::VeryHigh
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VeryLow => write!(f, "very_low"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::VeryHigh => write!(f, "very_high"),
        }
    }
}

/// How strongly the reported confidence disagrees with the governed score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyFlag {
    None,
    Potential,
    Likely,
}

impl AnomalyFlag {
    /// Classify a divergence value.
    pub fn from_divergence(divergence: f64) -> Self {
        if divergence >= LIKELY_DIVERGENCE {
            AnomalyFlag::Likely
        } else if divergence >= POTENTIAL_DIVERGENCE {
            AnomalyFlag::Potential
        } else {
            AnomalyFlag::None
        }
    }
}

impl std::fmt::Display for AnomalyFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Potential => write!(f, "potential"),
            Self::Likely => write!(f, "likely"),
        }
    }
}

/// Governed confidence for one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    /// Blended score (0.0–1.0)
    pub final_score: f64,
    /// Score as reported by the agent(s)
    pub reported_score: f64,
    /// Σ evidence.weight
    pub evidence_weight_sum: f64,
    /// Number of evidence items considered
    pub evidence_count: usize,
    pub confidence_level: ConfidenceLevel,
    pub anomaly_flag: AnomalyFlag,
    /// |reported − final|
    pub divergence: f64,
}

impl ConfidenceAssessment {
    /// Whether the assessment should be escalated as a hallucination.
    pub fn is_likely_anomaly(&self) -> bool {
        self.anomaly_flag == AnomalyFlag::Likely
    }
}

/// Per-call context for an assessment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceContext {
    /// What is being assessed (used for logging and error messages)
    #[serde(default)]
    pub subject: String,
    /// Replaces the policy's base weight for this call
    #[serde(default)]
    pub base_weight: Option<f64>,
}

impl ConfidenceContext {
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            base_weight: None,
        }
    }
}

/// Confidence policy with a validated base weight.
#[derive(Debug, Clone)]
pub struct ConfidencePolicy {
    base_weight: f64,
}

impl ConfidencePolicy {
    /// Create a policy. `base_weight` must be positive.
    pub fn new(base_weight: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            base_weight: ConfigError::check_positive("confidence.base_weight", base_weight)?,
        })
    }

    pub fn base_weight(&self) -> f64 {
        self.base_weight
    }

    /// Blend `agent_confidence` with `evidence`.
    ///
    /// Fails only on malformed input; an empty evidence list or zero total
    /// weight falls back to the agent confidence alone.
    pub fn calculate(
        &self,
        agent_confidence: f64,
        evidence: &[EvidenceItem],
        context: &ConfidenceContext,
    ) -> Result<ConfidenceAssessment, ValidationError> {
        let subject = if context.subject.is_empty() {
            "assessment"
        } else {
            context.subject.as_str()
        };
        check_confidence(subject, agent_confidence)?;
        for item in evidence {
            item.validate()?;
        }

        let base_weight = match context.base_weight {
            Some(w) if w.is_finite() && w > 0.0 => w,
            Some(w) => {
                return Err(ValidationError::NonPositiveWeight {
                    subject: format!("{} base weight", subject),
                    value: w,
                })
            }
            None => self.base_weight,
        };

        let evidence_weight_sum: f64 = evidence.iter().map(|e| e.weight).sum();
        let evidence_contribution = if evidence_weight_sum > 0.0 {
            let weighted: f64 = evidence.iter().map(|e| e.confidence * e.weight).sum();
            (weighted / evidence_weight_sum) * EVIDENCE_FACTOR
        } else {
            0.0
        };

        let mut final_score = (agent_confidence * base_weight + evidence_contribution).min(1.0);
        if !final_score.is_finite() {
            final_score = agent_confidence;
        }
        let final_score = final_score.clamp(0.0, 1.0);

        let divergence = (agent_confidence - final_score).abs();
        let anomaly_flag = AnomalyFlag::from_divergence(divergence);

        debug!(
            subject,
            agent_confidence,
            final_score,
            divergence,
            %anomaly_flag,
            evidence = evidence.len(),
            "Confidence assessed"
        );

        Ok(ConfidenceAssessment {
            final_score,
            reported_score: agent_confidence,
            evidence_weight_sum,
            evidence_count: evidence.len(),
            confidence_level: ConfidenceLevel::from_score(final_score),
            anomaly_flag,
            divergence,
        })
    }

    /// Whether an assessment can be trusted without further review.
    pub fn validate(&self, assessment: &ConfidenceAssessment) -> bool {
        if assessment.anomaly_flag == AnomalyFlag::Likely {
            return false;
        }
        !(assessment.evidence_count == 0
            && assessment.reported_score < UNSUPPORTED_MIN_CONFIDENCE)
    }
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self { base_weight: 1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(confidence: f64, weight: f64) -> EvidenceItem {
        EvidenceItem::new("test-source", confidence, weight).unwrap()
    }

    #[test]
    fn test_no_evidence_uses_agent_confidence() {
        let policy = ConfidencePolicy::default();
        let a = policy
            .calculate(0.83, &[], &ConfidenceContext::default())
            .unwrap();
        assert!((a.final_score - 0.83).abs() < 1e-12);
        assert_eq!(a.evidence_weight_sum, 0.0);
        assert_eq!(a.anomaly_flag, AnomalyFlag::None);
        assert_eq!(a.confidence_level, ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn test_evidence_contribution() {
        let policy = ConfidencePolicy::new(0.8).unwrap();
        // weighted avg = (0.9·2 + 0.6·1) / 3 = 0.8 → contribution 0.08
        let items = vec![evidence(0.9, 2.0), evidence(0.6, 1.0)];
        let a = policy
            .calculate(0.5, &items, &ConfidenceContext::for_subject("alert-1"))
            .unwrap();
        assert!((a.final_score - (0.4 + 0.08)).abs() < 1e-9);
        assert!((a.evidence_weight_sum - 3.0).abs() < 1e-12);
        assert_eq!(a.evidence_count, 2);
        assert_eq!(a.confidence_level, ConfidenceLevel::Medium);
    }

    #[test]
    fn test_final_score_capped() {
        let policy = ConfidencePolicy::new(1.5).unwrap();
        let a = policy
            .calculate(0.9, &[evidence(1.0, 1.0)], &ConfidenceContext::default())
            .unwrap();
        assert_eq!(a.final_score, 1.0);
        assert!((a.divergence - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_divergence_bands() {
        let policy = ConfidencePolicy::new(0.5).unwrap();

        // 0.5 → final 0.25 → divergence 0.25
        let potential = policy
            .calculate(0.5, &[], &ConfidenceContext::default())
            .unwrap();
        assert!((potential.divergence - 0.25).abs() < 1e-12);
        assert_eq!(potential.anomaly_flag, AnomalyFlag::Potential);

        // 0.7 → final 0.35 → divergence 0.35
        let likely = policy
            .calculate(0.7, &[], &ConfidenceContext::default())
            .unwrap();
        assert!((likely.divergence - 0.35).abs() < 1e-9);
        assert_eq!(likely.anomaly_flag, AnomalyFlag::Likely);
        assert!(likely.is_likely_anomaly());
    }

    #[test]
    fn test_anomaly_flag_boundaries() {
        assert_eq!(AnomalyFlag::from_divergence(0.19), AnomalyFlag::None);
        assert_eq!(AnomalyFlag::from_divergence(0.2), AnomalyFlag::Potential);
        assert_eq!(AnomalyFlag::from_divergence(0.25), AnomalyFlag::Potential);
        assert_eq!(AnomalyFlag::from_divergence(0.3), AnomalyFlag::Likely);
        assert_eq!(AnomalyFlag::from_divergence(0.35), AnomalyFlag::Likely);
    }

    #[test]
    fn test_confidence_level_bands() {
        assert_eq!(ConfidenceLevel::from_score(0.0), ConfidenceLevel::VeryLow);
        assert_eq!(ConfidenceLevel::from_score(0.2), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(0.45), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.79), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.8), ConfidenceLevel::VeryHigh);
        assert_eq!(ConfidenceLevel::VeryHigh.to_string(), "very_high");
    }

    #[test]
    fn test_validate_rules() {
        let policy = ConfidencePolicy::default();

        let unsupported = policy
            .calculate(0.4, &[], &ConfidenceContext::default())
            .unwrap();
        assert!(!policy.validate(&unsupported));

        let supported = policy
            .calculate(0.4, &[evidence(0.5, 1.0)], &ConfidenceContext::default())
            .unwrap();
        assert!(policy.validate(&supported));

        let confident = policy
            .calculate(0.9, &[], &ConfidenceContext::default())
            .unwrap();
        assert!(policy.validate(&confident));

        let skewed = ConfidencePolicy::new(0.5)
            .unwrap()
            .calculate(0.9, &[evidence(0.9, 1.0)], &ConfidenceContext::default())
            .unwrap();
        assert_eq!(skewed.anomaly_flag, AnomalyFlag::Likely);
        assert!(!policy.validate(&skewed));
    }

    #[test]
    fn test_malformed_input_rejected() {
        let policy = ConfidencePolicy::default();
        assert!(matches!(
            policy.calculate(1.1, &[], &ConfidenceContext::default()),
            Err(ValidationError::ConfidenceOutOfRange { .. })
        ));

        let bad = EvidenceItem {
            source: "feed".to_string(),
            confidence: 2.0,
            weight: 1.0,
        };
        assert!(policy
            .calculate(0.5, &[bad], &ConfidenceContext::default())
            .is_err());

        let ctx = ConfidenceContext {
            subject: "x".to_string(),
            base_weight: Some(0.0),
        };
        assert!(matches!(
            policy.calculate(0.5, &[], &ctx),
            Err(ValidationError::NonPositiveWeight { .. })
        ));
    }

    #[test]
    fn test_context_base_weight_override() {
        let policy = ConfidencePolicy::default();
        let ctx = ConfidenceContext {
            subject: "override".to_string(),
            base_weight: Some(0.5),
        };
        let a = policy.calculate(0.8, &[], &ctx).unwrap();
        assert!((a.final_score - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_policy_construction() {
        assert!(ConfidencePolicy::new(0.0).is_err());
        assert!(ConfidencePolicy::new(-1.0).is_err());
        assert_eq!(ConfidencePolicy::default().base_weight(), 1.0);
    }
}
