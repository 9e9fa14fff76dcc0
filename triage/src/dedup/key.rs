//! Stable deduplication fingerprints.

use serde::{Deserialize, Serialize};

use crate::opinion::AlertEvent;

/// Hex characters kept from the blake3 digest.
const KEY_HEX_LEN: usize = 32;

/// The fields that identify "the same real-world event".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFingerprint {
    pub source_id: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub source_system: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

impl EventFingerprint {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            event_type: None,
            source_system: None,
            severity: None,
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

    /// Stable key: blake3 over the length-prefixed fields.
    ///
    /// Fields are trimmed and lowercased so cosmetic differences in the
    /// source do not split one event into several executions.
    pub fn key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for field in [
            Some(self.source_id.as_str()),
            self.event_type.as_deref(),
            self.source_system.as_deref(),
            self.severity.as_deref(),
        ] {
            match field {
                Some(value) => {
                    let value = value.trim().to_lowercase();
                    hasher.update(&[1]);
                    hasher.update(&(value.len() as u64).to_le_bytes());
                    hasher.update(value.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        let hex = hasher.finalize().to_hex();
        hex.as_str()[..KEY_HEX_LEN].to_string()
    }
}

impl From<&AlertEvent> for EventFingerprint {
    fn from(alert: &AlertEvent) -> Self {
        Self {
            source_id: alert.source_id.clone(),
            event_type: alert.event_type.clone(),
            source_system: alert.source_system.clone(),
            severity: alert.severity.clone(),
        }
    }
}
