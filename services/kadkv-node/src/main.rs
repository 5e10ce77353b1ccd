//! kadkv node
//!
//! Runs two DHT nodes in one process, connects them, waits for both routing
//! tables to populate, stores a value from the second node and reads it back
//! from the first.

use anyhow::Context;
use clap::Parser;
use kadkv_dht::orchestrator::{close_all, round_trip};
use kadkv_dht::prelude::*;
use kadkv_dht::{Libp2pFactory, MemoryNetwork, NodeFactory};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// kadkv node CLI arguments
#[derive(Parser, Debug)]
#[command(name = "kadkv-node")]
#[command(about = "Two-node Kademlia key-value demonstration")]
struct Args {
    /// Mode of the first (reading) node
    #[arg(long, default_value = "server")]
    mode_a: NodeMode,

    /// Mode of the second (writing) node
    #[arg(long, default_value = "server")]
    mode_b: NodeMode,

    /// Record key, including the namespace prefix
    #[arg(long, default_value = "/myapp/testkey")]
    key: String,

    /// Record value
    #[arg(long, default_value = "Hello, libp2p DHT!")]
    value: String,

    /// Put/get attempts
    #[arg(long)]
    attempts: Option<u32>,

    /// Delay between attempts in milliseconds
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Deadline for the whole fetch in seconds
    #[arg(long)]
    fetch_timeout_secs: Option<u64>,

    /// Routing readiness poll interval of the first node in milliseconds
    #[arg(long)]
    poll_a_ms: Option<u64>,

    /// Routing readiness poll interval of the second node in milliseconds
    #[arg(long)]
    poll_b_ms: Option<u64>,

    /// JSON configuration file used as the base for both nodes
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run on the in-process substrate instead of TCP
    #[arg(long)]
    memory: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

const DEFAULT_POLL_A_MS: u64 = 3000;
const DEFAULT_POLL_B_MS: u64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let (first, second) = node_configs(&args)?;
    info!("Starting kadkv node pair");

    let outcome = if args.memory {
        run(NodeOrchestrator::with_configs(MemoryNetwork::new(), first, second), &args).await
    } else {
        run(NodeOrchestrator::with_configs(Libp2pFactory, first, second), &args).await
    };

    if let Err(e) = &outcome {
        match e.attempts() {
            Some(attempts) => error!(attempts, "Run failed: {}", e),
            None => error!("Run failed: {}", e),
        }
    }
    outcome.context("kadkv node run failed")
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = if args.verbose {
        EnvFilter::new("debug,libp2p_kad=debug,libp2p_swarm=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if args.json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn node_configs(args: &Args) -> anyhow::Result<(DhtConfig, DhtConfig)> {
    let base = match &args.config {
        Some(path) => DhtConfig::from_json_file(path)?,
        None => DhtConfig::default(),
    };

    let mut first = base.clone();
    let mut second = base;
    for config in [&mut first, &mut second] {
        if let Some(attempts) = args.attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(delay) = args.retry_delay_ms {
            config.retry.initial_delay_ms = delay;
            config.retry.max_delay_ms = config.retry.max_delay_ms.max(delay);
        }
        if let Some(secs) = args.fetch_timeout_secs {
            config.fetch_timeout_secs = secs;
        }
    }

    // Without a config file the first node polls slowly and the second quickly.
    let from_file = args.config.is_some();
    if let Some(ms) = args.poll_a_ms.or((!from_file).then_some(DEFAULT_POLL_A_MS)) {
        first.readiness = ReadinessConfig::every(Duration::from_millis(ms));
    }
    if let Some(ms) = args.poll_b_ms.or((!from_file).then_some(DEFAULT_POLL_B_MS)) {
        second.readiness = ReadinessConfig {
            poll_interval_ms: ms,
            ..second.readiness
        };
    }

    for config in [&first, &second] {
        config.validate().map_err(DhtError::Configuration)?;
    }
    Ok((first, second))
}

async fn run<F: NodeFactory>(orchestrator: NodeOrchestrator<F>, args: &Args) -> Result<()> {
    let (node_a, node_b) = orchestrator.build_pair(args.mode_a, args.mode_b).await?;
    let nodes = [node_a, node_b];

    let outcome = exchange(&nodes, args).await;
    close_all(&nodes).await;
    outcome
}

async fn exchange<S: Substrate>(nodes: &[DhtNode<S>; 2], args: &Args) -> Result<()> {
    let sizes = wait_all_ready(nodes).await?;
    info!("Routing tables ready: node 1 = {}, node 2 = {}", sizes[0], sizes[1]);

    // Node 2 stores, node 1 reads back.
    let retrieved = round_trip(&nodes[1], &nodes[0], &args.key, args.value.as_bytes()).await?;
    println!(
        "Retrieved value for key {}: {}",
        args.key,
        String::from_utf8_lossy(&retrieved)
    );
    Ok(())
}
