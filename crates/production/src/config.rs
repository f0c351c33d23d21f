//! Node configuration file.
//!
//! ```toml
//! data_dir = "./data"
//!
//! [storage]
//! max_background_jobs = 4
//! compression = "lz4"
//!
//! [consensus]
//! genesis_time = 1569024001000
//! validator_security = 2
//! milestone_key_depth = 10
//! initial_validators = ["5e5e...5e"]
//! local_snapshots_enabled = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tangle_consensus::ConsensusConfig;
use tangle_storage_rocksdb::RocksDbConfig;

/// Everything `tangle-node` reads from its TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Database and local snapshot directory.
    pub data_dir: PathBuf,

    pub storage: RocksDbConfig,

    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            storage: RocksDbConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

/// Command line settings that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub testnet: bool,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(data_dir) = &overrides.data_dir {
            self.data_dir = data_dir.clone();
        }
        if overrides.testnet {
            self.consensus.testnet = true;
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tangle-db")
    }

    /// Relative local snapshot paths are taken relative to the data
    /// directory.
    pub fn resolve_paths(&mut self) {
        let base = &self.consensus.local_snapshots_base_path;
        if base.is_relative() {
            self.consensus.local_snapshots_base_path = self.data_dir.join(base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_types::Hash;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            data_dir = "/var/lib/tangle"

            [consensus]
            round_duration = 30000
            initial_validators = ["0101010101010101010101010101010101010101010101010101010101010101"]
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/tangle"));
        assert_eq!(config.consensus.round_duration, 30_000);
        assert_eq!(config.consensus.round_pause, 5_000);
        assert_eq!(config.consensus.initial_validators, vec![Hash::new([1; 32])]);
        assert_eq!(config.storage.max_background_jobs, 4);
    }

    #[test]
    fn test_overrides_and_paths() {
        let mut config = NodeConfig::default();
        config.apply_overrides(&Overrides {
            data_dir: Some(PathBuf::from("/tmp/node")),
            testnet: true,
        });
        config.resolve_paths();
        assert!(config.consensus.testnet);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/node/tangle-db"));
        assert_eq!(
            config.consensus.local_snapshots_base_path,
            PathBuf::from("/tmp/node/local-snapshot")
        );
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "data_dir = 5").unwrap();
        let err = NodeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("node.toml"));
        assert!(NodeConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
