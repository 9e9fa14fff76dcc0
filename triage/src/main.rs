//! Triage CLI
//!
//! Replays recorded rounds through the decision engine.
//!
//! # Usage
//!
//! ```bash
//! # Consensus + confidence + decision for a recorded set of opinions
//! triage decide --input round.json
//!
//! # Full pipeline (dedup, fan-out, decide, checkpoint) with in-memory stores
//! triage run --input round.json --repeat 2
//!
//! # Effective configuration after file and TRIAGE_* overrides
//! triage config --config triage.toml
//! ```
//!
//! A round file looks like:
//!
//! ```json
//! {
//!   "alert": { "source_id": "cpu-high-web-01", "severity": "critical" },
//!   "opinions": [
//!     { "agent_id": "ti", "role": "threat_intel", "confidence": 0.9,
//!       "evidence_count": 3, "result_label": "escalate" }
//!   ],
//!   "evidence": [ { "source": "siem", "confidence": 0.8, "weight": 1.0 } ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use triage::checkpoint::{CheckpointEngine, CheckpointStore, InMemoryCheckpointStore};
use triage::{
    AgentOpinion, AgentRegistry, AlertEvent, ConsensusContext, DecisionOrchestrator, EvidenceItem,
    FixedOpinionAgent, TriageConfig, TriagePipeline,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (TRIAGE_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive a decision from recorded opinions and evidence
    Decide {
        /// Round file (JSON)
        #[arg(long)]
        input: PathBuf,
    },
    /// Run the full pipeline, replaying each recorded opinion as an evaluator
    Run {
        /// Round file (JSON)
        #[arg(long)]
        input: PathBuf,

        /// Submit the alert this many times (repeats are deduplicated)
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Path to RocksDB state directory for checkpoint persistence
        #[cfg(feature = "rocksdb")]
        #[arg(long)]
        state_path: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// A recorded round
#[derive(Debug, Deserialize)]
struct RoundFile {
    #[serde(default)]
    alert: Option<AlertEvent>,
    #[serde(default)]
    opinions: Vec<AgentOpinion>,
    #[serde(default)]
    evidence: Vec<EvidenceItem>,
}

impl RoundFile {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read round file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse round file {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = TriageConfig::load(args.config.as_deref()).context("Invalid configuration")?;

    match args.command {
        Command::Decide { input } => decide(&config, &input),
        #[cfg(feature = "rocksdb")]
        Command::Run {
            input,
            repeat,
            state_path,
        } => run(&config, &input, repeat, state_path.as_deref()).await,
        #[cfg(not(feature = "rocksdb"))]
        Command::Run { input, repeat } => run(&config, &input, repeat, None).await,
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn decide(config: &TriageConfig, input: &Path) -> Result<()> {
    let round = RoundFile::load(input)?;
    let orchestrator = DecisionOrchestrator::from_config(config)?;
    let context = ConsensusContext {
        security_flagged: round.alert.as_ref().is_some_and(|a| a.security_flagged),
        ..ConsensusContext::default()
    };

    let decision = orchestrator
        .decide(&round.opinions, &round.evidence, &context)
        .context("Round rejected")?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

async fn run(config: &TriageConfig, input: &Path, repeat: u32, state_path: Option<&Path>) -> Result<()> {
    let round = RoundFile::load(input)?;
    let alert = round
        .alert
        .context("`run` needs an `alert` in the round file")?;

    let mut registry = AgentRegistry::new();
    for opinion in round.opinions {
        registry.register(FixedOpinionAgent::from_opinion(opinion).shared())?;
    }

    let store = open_store(state_path)?;
    let pipeline = TriagePipeline::new(
        Arc::new(config.dedup.build_local()?),
        registry,
        DecisionOrchestrator::from_config(config)?,
        CheckpointEngine::new(store, config.checkpoint.retry.clone()),
    )
    .with_timeouts(config.round.agent_timeout(), config.round.round_timeout())?
    .with_retention(config.checkpoint.keep_last);

    info!(agents = pipeline.registry().len(), repeat, "Running triage pipeline");

    for _ in 0..repeat.max(1) {
        let outcome = pipeline.run(&alert, &round.evidence).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Ok(())
}

#[cfg(feature = "rocksdb")]
fn open_store(state_path: Option<&Path>) -> Result<Arc<dyn CheckpointStore>> {
    match state_path {
        Some(path) => {
            let store = triage::RocksCheckpointStore::open(path)
                .with_context(|| format!("Failed to open checkpoint store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryCheckpointStore::new())),
    }
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(_state_path: Option<&Path>) -> Result<Arc<dyn CheckpointStore>> {
    Ok(Arc::new(InMemoryCheckpointStore::new()))
}
