//! Shared error taxonomy for construction-time and input validation.
//!
//! Infrastructure errors (key-value store, checkpoint store) live next to
//! the seams that produce them; this module only holds the two classes
//! that are fatal to a caller: bad configuration and malformed input.

/// Invalid policy parameters, rejected when a component is constructed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Check that `value` is a finite number in [0, 1].
    pub fn check_unit(name: &'static str, value: f64) -> Result<f64, ConfigError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(value)
        } else {
            Err(ConfigError::ThresholdOutOfRange { name, value })
        }
    }

    /// Check that `value` is a finite number strictly greater than zero.
    pub fn check_positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
        if value.is_finite() && value > 0.0 {
            Ok(value)
        } else {
            Err(ConfigError::NonPositive { name, value })
        }
    }
}

/// Malformed round input. Aborts the whole round: every weighted term
/// contributes to the aggregate, so nothing is dropped silently.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Confidence for {subject} must be within [0, 1], got {value}")]
    ConfidenceOutOfRange { subject: String, value: f64 },

    #[error("Weight for {subject} must be positive, got {value}")]
    NonPositiveWeight { subject: String, value: f64 },

    #[error("Agent id must not be empty")]
    EmptyAgentId,

    #[error("Result label for {agent_id} must not be empty")]
    EmptyLabel { agent_id: String },

    #[error("Source id must not be empty")]
    EmptySourceId,

    #[error("Malformed input: {0}")]
    Malformed(String),
}

/// Validate a confidence-like score for `subject`.
pub(crate) fn check_confidence(subject: &str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::ConfidenceOutOfRange {
            subject: subject.to_string(),
            value,
        })
    }
}
