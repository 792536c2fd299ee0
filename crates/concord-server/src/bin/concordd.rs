//! Concord Node Daemon
//!
//! The `concordd` binary runs one Concord node:
//! - Loads the node configuration (file, then command-line overrides)
//! - Recovers from the write-ahead log
//! - Serves the commit protocol over TCP
//! - Shuts down on SIGTERM/SIGINT
//!
//! # Usage
//!
//! ```bash
//! # Start node 1 with defaults
//! concordd --node-id 1
//!
//! # Start from a configuration file
//! concordd --config /etc/concord/node1.toml
//!
//! # Two-node cluster on one machine
//! concordd --node-id 1 --listen 127.0.0.1:7401 --peer 2=127.0.0.1:7402 --account alice=100
//! concordd --node-id 2 --listen 127.0.0.1:7402 --peer 1=127.0.0.1:7401 --account bob=50
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use concord_common::config::NodeConfig;
use concord_common::types::NodeId;
use concord_server::Server;

/// Concord Node Daemon
#[derive(Parser, Debug)]
#[command(
    name = "concordd",
    author = "Concord Team",
    version,
    about = "Concord distributed transaction node",
    long_about = "Concord coordinates atomic transactions across nodes with two-phase commit.\n\n\
                  This daemon runs one node and listens for protocol traffic."
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "CONCORD_CONFIG")]
    config: Option<PathBuf>,

    /// Node id (positive)
    #[arg(short = 'n', long, env = "CONCORD_NODE_ID")]
    node_id: Option<u32>,

    /// Address to listen on
    #[arg(short = 'l', long, value_name = "ADDR", env = "CONCORD_LISTEN")]
    listen: Option<String>,

    /// Write-ahead log directory
    #[arg(short = 'w', long, value_name = "DIR", env = "CONCORD_WAL_DIR")]
    wal_dir: Option<PathBuf>,

    /// Peer as ID=ADDR; repeatable
    #[arg(short = 'p', long = "peer", value_name = "ID=ADDR")]
    peers: Vec<String>,

    /// Seed account as NAME=BALANCE; repeatable
    #[arg(short = 'a', long = "account", value_name = "NAME=BALANCE")]
    accounts: Vec<String>,

    /// Use wait-for-graph deadlock detection
    #[arg(long)]
    deadlock_detection: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "CONCORD_LOG_LEVEL")]
    log_level: String,

    /// Print configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    run_node(config).await
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_new(format!(
        "concord_server={level},concord_commit={level},concord_txn={level},concord_wal={level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = if let Some(path) = &args.config {
        NodeConfig::from_file(path).context("Failed to load config file")?
    } else {
        NodeConfig::default()
    };

    if let Some(id) = args.node_id {
        config.node_id = id;
    }
    if let Some(addr) = &args.listen {
        config.listen_addr = addr.clone();
    }
    if let Some(dir) = &args.wal_dir {
        config.wal_dir = dir.clone();
    }
    for peer in &args.peers {
        let (id, addr) = split_pair(peer).context("Invalid --peer")?;
        let id: u32 = id.parse().with_context(|| format!("Invalid peer id in {:?}", peer))?;
        config = config.with_peer(NodeId::new(id), addr);
    }
    for account in &args.accounts {
        let (name, balance) = split_pair(account).context("Invalid --account")?;
        let balance: i64 = balance
            .parse()
            .with_context(|| format!("Invalid balance in {:?}", account))?;
        config = config.with_account(name, balance);
    }
    if args.deadlock_detection {
        config.deadlock_detection = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn split_pair(value: &str) -> Result<(&str, &str)> {
    match value.split_once('=') {
        Some((key, rest)) if !key.is_empty() && !rest.is_empty() => Ok((key, rest)),
        _ => bail!("expected KEY=VALUE, got {:?}", value),
    }
}

async fn run_node(config: NodeConfig) -> Result<()> {
    info!("Node configuration:");
    info!("  Node id: {}", config.node_id);
    info!("  Listen address: {}", config.listen_addr);
    info!("  WAL directory: {}", config.wal_dir.display());
    info!("  Peers: {}", config.peers.len());
    info!("  Accounts: {}", config.accounts.len());

    let server = Server::start(config).await.context("Failed to start node")?;

    info!("Listening on {}", server.local_addr());
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await?;

    info!("Shutdown signal received");
    let status = server.node().node_status();
    if status.in_doubt > 0 {
        info!(
            "{} transactions remain in doubt and will be resolved after restart",
            status.in_doubt
        );
    }
    server.shutdown();

    info!("Node stopped. Goodbye!");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install signal handler")?;
        tokio::select! {
            result = ctrl_c => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await
    }
}
