//! Checkpoint data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the caller hands to `persist_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    /// Orchestration state at this step
    pub state_blob: Value,
    /// Optional evaluator memory captured alongside the step
    #[serde(default)]
    pub agent_memory_snapshot: Option<Value>,
    /// Inputs the decision was made from
    #[serde(default)]
    pub decision_context: Value,
}

impl StepPayload {
    pub fn new(state_blob: Value) -> Self {
        Self {
            state_blob,
            agent_memory_snapshot: None,
            decision_context: Value::Null,
        }
    }

    pub fn with_agent_memory(mut self, snapshot: Value) -> Self {
        self.agent_memory_snapshot = Some(snapshot);
        self
    }

    pub fn with_decision_context(mut self, context: Value) -> Self {
        self.decision_context = context;
        self
    }
}

/// One immutable step of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub thread_id: String,
    pub step_index: u64,
    pub state_blob: Value,
    #[serde(default)]
    pub agent_memory_snapshot: Option<Value>,
    #[serde(default)]
    pub decision_context: Value,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(thread_id: impl Into<String>, step_index: u64, payload: StepPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            step_index,
            state_blob: payload.state_blob,
            agent_memory_snapshot: payload.agent_memory_snapshot,
            decision_context: payload.decision_context,
            created_at: Utc::now(),
        }
    }

    /// The payload this record was written from.
    pub fn payload(&self) -> StepPayload {
        StepPayload {
            state_blob: self.state_blob.clone(),
            agent_memory_snapshot: self.agent_memory_snapshot.clone(),
            decision_context: self.decision_context.clone(),
        }
    }
}

/// Thread metadata. A thread is the lineage of one alert's steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Highest step index ever appended. Survives retention, so pruned
    /// indices are never handed out again.
    #[serde(default)]
    pub last_step_index: Option<u64>,
}

impl ThreadInfo {
    pub fn new(thread_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            created_at: now,
            updated_at: now,
            last_step_index: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record an appended step.
    pub fn record_step(&mut self, step_index: u64) {
        self.last_step_index = Some(self.last_step_index.map_or(step_index, |i| i.max(step_index)));
        self.touch();
    }

    /// Index the next step should use.
    pub fn next_step_index(&self) -> u64 {
        self.last_step_index.map_or(0, |i| i + 1)
    }
}

/// Steps from a given index onward, for resuming a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replay {
    pub thread_id: String,
    pub from_step: u64,
    /// Ascending by `step_index`; the first element is the resume point
    pub steps: Vec<CheckpointRecord>,
}

impl Replay {
    /// The step replay starts from.
    pub fn resume_point(&self) -> Option<&CheckpointRecord> {
        self.steps.first()
    }

    /// The most recent step in the replay.
    pub fn head(&self) -> Option<&CheckpointRecord> {
        self.steps.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_preserves_payload() {
        let payload = StepPayload::new(json!({"state": "escalated"}))
            .with_agent_memory(json!({"threat_intel": ["ioc-1"]}))
            .with_decision_context(json!({"aggregate": 0.84}));
        let record = CheckpointRecord::new("thread-1", 3, payload.clone());
        assert_eq!(record.payload(), payload);
        assert_eq!(record.step_index, 3);
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_payload_defaults_on_deserialize() {
        let payload: StepPayload = serde_json::from_str(r#"{"state_blob": {"a": 1}}"#).unwrap();
        assert!(payload.agent_memory_snapshot.is_none());
        assert_eq!(payload.decision_context, Value::Null);
    }

    #[test]
    fn test_thread_high_water_mark() {
        let mut info = ThreadInfo::new("t");
        assert_eq!(info.next_step_index(), 0);
        info.record_step(4);
        info.record_step(2);
        assert_eq!(info.last_step_index, Some(4));
        assert_eq!(info.next_step_index(), 5);

        // threads written before the field existed
        let legacy: ThreadInfo = serde_json::from_value(serde_json::json!({
            "thread_id": "t",
            "created_at": info.created_at,
            "updated_at": info.updated_at,
        }))
        .unwrap();
        assert_eq!(legacy.last_step_index, None);
    }
}
