//! Engine configuration.
//!
//! Loaded in three layers: built-in defaults, an optional TOML file, then
//! `TRIAGE_*` environment overrides. [`TriageConfig::validate`] runs after
//! the last layer; every component constructor validates again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checkpoint::DEFAULT_KEEP_LAST;
use crate::confidence::ConfidencePolicy;
use crate::consensus::engine::{DEFAULT_ANOMALY_DIVERGENCE, DEFAULT_SECURITY_MULTIPLIER};
use crate::consensus::{ConsensusEngine, ConsensusStrategy, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::dedup::distributed::{DEFAULT_LOCK_TTL_SECS, DEFAULT_LOCK_WAIT_MS};
use crate::dedup::{
    DistributedDeduplicator, KeyValueStore, LocalDeduplicator, DEFAULT_CAPACITY, DEFAULT_TTL_SECS,
};
use crate::error::ConfigError;
use crate::orchestrator::decision::{DEFAULT_MAJORITY_AUTO_THRESHOLD, DEFAULT_UNANIMOUS_AUTO_THRESHOLD};
use crate::retry::RetryPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub consensus: ConsensusConfig,
    pub confidence: ConfidenceConfig,
    pub orchestrator: OrchestratorConfig,
    pub dedup: DedupConfig,
    pub checkpoint: CheckpointConfig,
    pub round: RoundConfig,
}

/// Which consensus strategy the orchestrator applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Weighted,
    Unanimous,
    Majority,
}

impl std::str::FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weighted" => Ok(Self::Weighted),
            "unanimous" => Ok(Self::Unanimous),
            "majority" => Ok(Self::Majority),
            other => Err(ConfigError::Invalid {
                name: "consensus.strategy",
                reason: format!("unknown strategy '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Aggregate score below which a round needs review
    pub threshold: f64,
    pub strategy: StrategyKind,
    /// Only used by the majority strategy
    pub majority_threshold: f64,
    /// Threat-intel weight multiplier for security-flagged alerts
    pub security_multiplier: f64,
    /// Per-agent divergence from the aggregate that counts as anomalous
    pub anomaly_divergence: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            strategy: StrategyKind::Weighted,
            majority_threshold: 0.5,
            security_multiplier: DEFAULT_SECURITY_MULTIPLIER,
            anomaly_divergence: DEFAULT_ANOMALY_DIVERGENCE,
        }
    }
}

impl ConsensusConfig {
    pub fn build_engine(&self) -> Result<ConsensusEngine, ConfigError> {
        ConsensusEngine::new(self.threshold)?
            .with_anomaly_divergence(self.anomaly_divergence)?
            .with_security_multiplier(self.security_multiplier)
    }

    pub fn build_strategy(&self) -> Result<ConsensusStrategy, ConfigError> {
        match self.strategy {
            StrategyKind::Weighted => Ok(ConsensusStrategy::Weighted),
            StrategyKind::Unanimous => Ok(ConsensusStrategy::Unanimous),
            StrategyKind::Majority => ConsensusStrategy::majority(self.majority_threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub base_weight: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self { base_weight: 1.0 }
    }
}

impl ConfidenceConfig {
    pub fn build_policy(&self) -> Result<ConfidencePolicy, ConfigError> {
        ConfidencePolicy::new(self.base_weight)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Unanimous rounds auto-act only above this aggregate
    pub unanimous_auto_threshold: f64,
    /// Majority rounds auto-act only above this aggregate
    pub majority_auto_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            unanimous_auto_threshold: DEFAULT_UNANIMOUS_AUTO_THRESHOLD,
            majority_auto_threshold: DEFAULT_MAJORITY_AUTO_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_secs: u64,
    /// Local variant only
    pub capacity: usize,
    /// Distributed variant only
    pub lock_ttl_secs: u64,
    /// Distributed variant only
    pub lock_wait_ms: u64,
    /// Applied to each shared-store call (distributed variant)
    pub retry: RetryPolicy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            capacity: DEFAULT_CAPACITY,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            retry: RetryPolicy::default(),
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn build_local(&self) -> Result<LocalDeduplicator, ConfigError> {
        LocalDeduplicator::new(self.ttl(), self.capacity)
    }

    pub fn build_distributed(
        &self,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<DistributedDeduplicator, ConfigError> {
        Ok(DistributedDeduplicator::new(store, self.ttl(), self.lock_ttl())?
            .with_retry(self.retry.clone())?
            .with_lock_wait(self.lock_wait()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Steps kept per thread by retention
    pub keep_last: usize,
    pub retry: RetryPolicy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            keep_last: DEFAULT_KEEP_LAST,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Per-agent opinion timeout
    pub agent_timeout_ms: u64,
    /// Whole-round timeout
    pub round_timeout_ms: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 30_000,
            round_timeout_ms: 120_000,
        }
    }
}

impl RoundConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

impl TriageConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Defaults, then `path` if given, then the environment. Validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading config file");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRIAGE_*` overrides read through `lookup`.
    ///
    /// Values that fail to parse are logged and ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Option<T> {
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparseable config override");
                    None
                }
            }
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    if let Some(value) = parse($key, raw) {
                        $field = value;
                    }
                }
            };
        }

        override_field!("TRIAGE_CONSENSUS_THRESHOLD", self.consensus.threshold);
        override_field!("TRIAGE_CONSENSUS_STRATEGY", self.consensus.strategy);
        override_field!("TRIAGE_CONSENSUS_MAJORITY_THRESHOLD", self.consensus.majority_threshold);
        override_field!("TRIAGE_CONSENSUS_SECURITY_MULTIPLIER", self.consensus.security_multiplier);
        override_field!("TRIAGE_CONSENSUS_ANOMALY_DIVERGENCE", self.consensus.anomaly_divergence);
        override_field!("TRIAGE_CONFIDENCE_BASE_WEIGHT", self.confidence.base_weight);
        override_field!(
            "TRIAGE_ORCHESTRATOR_UNANIMOUS_AUTO_THRESHOLD",
            self.orchestrator.unanimous_auto_threshold
        );
        override_field!(
            "TRIAGE_ORCHESTRATOR_MAJORITY_AUTO_THRESHOLD",
            self.orchestrator.majority_auto_threshold
        );
        override_field!("TRIAGE_DEDUP_TTL_SECS", self.dedup.ttl_secs);
        override_field!("TRIAGE_DEDUP_CAPACITY", self.dedup.capacity);
        override_field!("TRIAGE_DEDUP_LOCK_TTL_SECS", self.dedup.lock_ttl_secs);
        override_field!("TRIAGE_DEDUP_LOCK_WAIT_MS", self.dedup.lock_wait_ms);
        override_field!("TRIAGE_DEDUP_MAX_ATTEMPTS", self.dedup.retry.max_attempts);
        override_field!("TRIAGE_DEDUP_INITIAL_DELAY_MS", self.dedup.retry.initial_delay_ms);
        override_field!("TRIAGE_DEDUP_BACKOFF_FACTOR", self.dedup.retry.backoff_factor);
        override_field!("TRIAGE_CHECKPOINT_KEEP_LAST", self.checkpoint.keep_last);
        override_field!("TRIAGE_CHECKPOINT_MAX_ATTEMPTS", self.checkpoint.retry.max_attempts);
        override_field!("TRIAGE_CHECKPOINT_INITIAL_DELAY_MS", self.checkpoint.retry.initial_delay_ms);
        override_field!("TRIAGE_CHECKPOINT_BACKOFF_FACTOR", self.checkpoint.retry.backoff_factor);
        override_field!("TRIAGE_ROUND_AGENT_TIMEOUT_MS", self.round.agent_timeout_ms);
        override_field!("TRIAGE_ROUND_TIMEOUT_MS", self.round.round_timeout_ms);
    }

    /// Reject parameters no component would accept.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.consensus.build_engine()?;
        self.consensus.build_strategy()?;
        self.confidence.build_policy()?;
        ConfigError::check_unit(
            "orchestrator.unanimous_auto_threshold",
            self.orchestrator.unanimous_auto_threshold,
        )?;
        ConfigError::check_unit(
            "orchestrator.majority_auto_threshold",
            self.orchestrator.majority_auto_threshold,
        )?;
        non_zero("dedup.ttl_secs", self.dedup.ttl_secs)?;
        non_zero("dedup.capacity", self.dedup.capacity as u64)?;
        non_zero("dedup.lock_ttl_secs", self.dedup.lock_ttl_secs)?;
        self.dedup.retry.validate()?;
        non_zero("checkpoint.keep_last", self.checkpoint.keep_last as u64)?;
        self.checkpoint.retry.validate()?;
        non_zero("round.agent_timeout_ms", self.round.agent_timeout_ms)?;
        non_zero("round.round_timeout_ms", self.round.round_timeout_ms)?;
        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

fn non_zero(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be non-zero".to_string(),
        });
    }
    Ok(())
}
