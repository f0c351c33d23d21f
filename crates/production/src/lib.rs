//! Binaries of the Tangle node.
//!
//! - `tangle-node` loads a [`NodeConfig`], opens RocksDB under the data
//!   directory and runs the consensus workers until Ctrl+C or SIGTERM
//! - `tangle-keygen` generates a validator's Merkle keyfile and prints its
//!   address

mod config;

pub use config::{NodeConfig, Overrides};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}
