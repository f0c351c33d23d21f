//! Tangle node.
//!
//! # Usage
//!
//! ```bash
//! # Start with a configuration file
//! tangle-node --config node.toml
//!
//! # Override the data directory and run as a testnet node
//! tangle-node --config node.toml --data-dir /var/lib/tangle --testnet
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tangle_consensus::NoopRequestQueue;
use tangle_node::{Node, NodeServices};
use tangle_production::{init_logging, NodeConfig, Overrides};
use tangle_storage_rocksdb::RocksDbStore;
use tokio::signal;
use tracing::info;

/// Tangle node
///
/// Tracks milestones, applies solid rounds to the ledger and takes local
/// snapshots.
#[derive(Parser, Debug)]
#[command(name = "tangle-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for RocksDB and local snapshots (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run as a testnet node
    #[arg(long)]
    testnet: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    config.apply_overrides(&Overrides {
        data_dir: cli.data_dir.clone(),
        testnet: cli.testnet,
    });
    config.resolve_paths();

    init_logging(&cli.log_level)?;
    info!(
        data_dir = %config.data_dir.display(),
        testnet = config.consensus.testnet,
        validators = config.consensus.initial_validators.len(),
        "Tangle node starting"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory: {}", config.data_dir.display()))?;
    let db_path = config.database_path();
    let store = RocksDbStore::open_with_config(&db_path, config.storage.clone())
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    // No neighbors to ask without a networking layer.
    let services = NodeServices::new(Arc::new(store), Arc::new(NoopRequestQueue));
    let consensus = config.consensus.clone();
    let node = tokio::task::spawn_blocking(move || Node::start(consensus, services))
        .await
        .context("Node startup task failed")?
        .context("Failed to start node")?;

    info!("Node running, press Ctrl+C to stop");
    shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    tokio::task::spawn_blocking(move || node.stop())
        .await
        .context("Node shutdown task failed")?;
    info!("Shutdown complete");
    Ok(())
}
