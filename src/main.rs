//! raftd - Raft Consensus Node
//!
//! Runs one member of a Raft cluster and provides the commands to set up,
//! join and inspect it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raftd::api::HttpServer;
use raftd::config::{LoggingConfig, RaftdConfig};
use raftd::error::{Error, Result};
use raftd::log::{LogStore, SegmentLog};
use raftd::network::{NetworkClient, NetworkServer};
use raftd::raft::{CoreConfig, RaftCore, RaftNode, Scheduler, TimerConfig};
use raftd::state::SqliteLedger;

/// raftd - Raft consensus node
#[derive(Parser)]
#[command(name = "raftd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "raftd.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Ask a running cluster to add this node as a voter
    Join {
        /// Any cluster member (host:port); redirects are followed to the leader
        seed: String,

        /// Number of attempts before giving up
        #[arg(long, default_value_t = 10)]
        attempts: usize,
    },

    /// Show node status
    Status {
        /// HTTP API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "raftd.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config may not exist yet (init), so logging falls back to defaults
    let logging = RaftdConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(&logging, cli.log_level.as_deref());

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Join { seed, attempts } => run_join(cli.config, seed, attempts).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(config.level.as_str());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting raftd node...");

    let config = match RaftdConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let log = match SegmentLog::open(config.log_dir(), config.storage.clone()) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to open log at {:?}: {}", config.log_dir(), e);
            return Err(e);
        }
    };
    tracing::info!(
        "Log opened: last index {}, last term {}",
        log.last_index(),
        log.last_term()
    );

    let ledger = match SqliteLedger::open(config.state_dir()) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to open ledger at {:?}: {}", config.state_dir(), e);
            return Err(e);
        }
    };

    let core = RaftCore::new(
        CoreConfig::from_config(&config)?,
        Box::new(log),
        Box::new(ledger),
    )?;
    tracing::info!(
        "Recovered term {} with commit index {} and {} voters",
        core.current_term(),
        core.commit_index(),
        core.membership().size()
    );
    if config.cluster.join && core.membership().size() == 0 {
        tracing::info!("Waiting to be added with `raftd join`");
    }

    let transport = Arc::new(NetworkClient::new(config.connect_timeout(), config.rpc_timeout()));
    let scheduler = Scheduler::new(TimerConfig::from_config(&config));
    let (handle, node_task) = RaftNode::spawn(core, transport, scheduler);

    let network_server = Arc::new(NetworkServer::new(config.node.bind_address.clone(), handle.clone()));
    let http_server = HttpServer::new(config.api.clone(), config.node.id.clone(), handle.clone());

    let server = Arc::clone(&network_server);
    let mut network_task = tokio::spawn(async move { server.start().await });

    tokio::select! {
        result = &mut network_task => {
            match result {
                Ok(Err(e)) => tracing::error!("Network server error: {}", e),
                Err(e) => tracing::error!("Network server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = http_server.start(), if config.api.enabled => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    network_server.stop();
    handle.shutdown().await;
    if let Err(e) = node_task.await {
        tracing::error!("Node task failed: {}", e);
    }

    tracing::info!("raftd node stopped");
    Ok(())
}

/// Ask the cluster to add this node
async fn run_join(config_path: PathBuf, seed: String, attempts: usize) -> Result<()> {
    let config = RaftdConfig::from_file(&config_path)?;
    let node = config.self_descriptor();
    let client = NetworkClient::new(config.connect_timeout(), config.rpc_timeout());

    tracing::info!("Joining cluster via {} as {}", seed, node);

    match client
        .join_cluster(&seed, &node, attempts, Duration::from_millis(500))
        .await
    {
        Ok((leader, index)) => {
            println!("Membership change for {} proposed at index {} by {}", node, index, leader);
            println!("The node becomes a voter once that entry commits; check with `raftd status`.");
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to join cluster: {}", e);
            Err(e)
        }
    }
}

/// Query node status over the HTTP API
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            let pretty = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", pretty);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    std::fs::write(&output, RaftdConfig::sample(&node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the node address and initial peers.");
    println!("Then start with: raftd --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RaftdConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.cluster.peers.len());
            if config.cluster.join {
                println!("  Mode: join an existing cluster");
            } else {
                let voters = config.initial_membership()?;
                println!("  Initial Voters: {} (quorum {})", voters.size(), voters.quorum_size());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = RaftdConfig::from_file(&config_path)?;

    println!("raftd Node Information");
    println!("======================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Storage Configuration:");
    println!("  Segment Size:   {} MB", config.storage.segment_size_mb);
    println!("  Compression:    {}", config.storage.compression);
    println!("  Fsync:          {}", config.storage.fsync);
    println!();
    println!("Cluster Configuration:");
    println!("  Peers:          {:?}", config.cluster.peers);
    println!("  Join Mode:      {}", config.cluster.join);
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
    println!(
        "  Election:       {}-{} ms",
        config.cluster.election_timeout_min_ms, config.cluster.election_timeout_max_ms
    );
    println!("  Batch Entries:  {}", config.cluster.max_batch_entries);
    println!();
    println!("API:              {} (enabled: {})", config.api.bind_address, config.api.enabled);

    Ok(())
}
