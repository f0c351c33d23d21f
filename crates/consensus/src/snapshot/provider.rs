//! Ownership of the initial and latest snapshots.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tangle_types::{Hash, Snapshot, SnapshotMetaData, SnapshotState, SUPPLY};
use tracing::info;

use crate::config::ConsensusConfig;
use crate::error::SnapshotError;
use crate::snapshot::files;

/// Holds the `initial` snapshot the node started from and the `latest`
/// snapshot advanced by round application.
///
/// When both locks are needed, `initial` is taken first.
#[derive(Debug)]
pub struct SnapshotProvider {
    initial: RwLock<Snapshot>,
    latest: RwLock<Snapshot>,
}

impl SnapshotProvider {
    /// Start from `initial`; `latest` begins as a copy of it.
    pub fn new(initial: Snapshot) -> Self {
        let latest = initial.clone();
        Self {
            initial: RwLock::new(initial),
            latest: RwLock::new(latest),
        }
    }

    /// Load the initial snapshot: a local snapshot if one was written,
    /// otherwise the configured snapshot files, otherwise the builtin one.
    pub fn load(config: &ConsensusConfig) -> Result<Self, SnapshotError> {
        let base = &config.local_snapshots_base_path;
        let snapshot = if config.local_snapshots_enabled && files::exists(base) {
            info!(path = %base.display(), "Loading local snapshot");
            files::read_snapshot(base)?
        } else if let Some(base) = &config.snapshot_file {
            info!(path = %base.display(), "Loading snapshot files");
            files::read_snapshot(base)?
        } else {
            builtin_snapshot(config)
        };
        Ok(Self::new(with_null_entry_point(snapshot)))
    }

    pub fn initial(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.initial.read()
    }

    pub fn latest(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.latest.read()
    }

    pub fn latest_mut(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.latest.write()
    }

    /// The lock around `latest`, for replay and rollback.
    pub fn latest_lock(&self) -> &RwLock<Snapshot> {
        &self.latest
    }

    pub fn initial_index(&self) -> u64 {
        self.initial.read().index()
    }

    pub fn latest_index(&self) -> u64 {
        self.latest.read().index()
    }

    /// Whether `hash` is a solid entry point of the latest snapshot.
    pub fn is_solid_entry_point(&self, hash: &Hash) -> bool {
        self.latest.read().has_solid_entry_point(hash)
    }

    /// Record `hash` as a solid entry point at the initial index in both
    /// snapshots. Returns `false` if it already was one.
    pub fn patch_solid_entry_point(&self, hash: Hash) -> bool {
        let mut initial = self.initial.write();
        if initial.has_solid_entry_point(&hash) {
            return false;
        }
        let index = initial.index();
        initial.metadata.solid_entry_points.insert(hash, index);
        self.latest
            .write()
            .metadata
            .solid_entry_points
            .insert(hash, index);
        true
    }

    /// Replace the initial snapshot after a local snapshot was taken.
    ///
    /// `latest` keeps its state but adopts the new initial boundary and
    /// solid entry points.
    pub fn replace_initial(&self, snapshot: Snapshot) {
        let mut initial = self.initial.write();
        let mut latest = self.latest.write();
        latest.metadata.initial_hash = snapshot.hash();
        latest.metadata.initial_index = snapshot.index();
        latest.metadata.initial_timestamp = snapshot.timestamp();
        latest
            .metadata
            .solid_entry_points
            .clone_from(&snapshot.metadata.solid_entry_points);
        initial.update(&snapshot);
    }
}

/// The snapshot used when no files are configured: the whole supply on the
/// genesis address at the configured start round.
pub fn builtin_snapshot(config: &ConsensusConfig) -> Snapshot {
    let state = SnapshotState::new([(config.genesis_address, SUPPLY)].into());
    let metadata = SnapshotMetaData::new(
        Hash::NULL,
        config.milestone_start_index,
        config.snapshot_timestamp,
    );
    Snapshot::new(state, metadata)
}

fn with_null_entry_point(mut snapshot: Snapshot) -> Snapshot {
    let index = snapshot.index();
    snapshot
        .metadata
        .solid_entry_points
        .entry(Hash::NULL)
        .or_insert(index);
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_snapshot() {
        let config = ConsensusConfig {
            milestone_start_index: 7,
            genesis_address: Hash::new([1; 32]),
            ..Default::default()
        };
        let provider = SnapshotProvider::load(&config).unwrap();
        let initial = provider.initial();
        assert_eq!(initial.index(), 7);
        assert_eq!(initial.state.balance(&Hash::new([1; 32])), Some(SUPPLY));
        assert!(initial.has_solid_entry_point(&Hash::NULL));
        assert_eq!(*initial, *provider.latest());
    }

    #[test]
    fn test_loads_configured_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("genesis");
        let mut snapshot = builtin_snapshot(&ConsensusConfig::default());
        snapshot.metadata = SnapshotMetaData::new(Hash::new([2; 32]), 11, 99);
        files::write_snapshot(&snapshot, &base).unwrap();

        let config = ConsensusConfig {
            snapshot_file: Some(base),
            ..Default::default()
        };
        let provider = SnapshotProvider::load(&config).unwrap();
        assert_eq!(provider.initial_index(), 11);
        assert_eq!(provider.latest().hash(), Hash::new([2; 32]));
        assert!(provider.is_solid_entry_point(&Hash::NULL));
    }

    #[test]
    fn test_local_snapshot_preferred_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let mut snapshot = builtin_snapshot(&ConsensusConfig::default());
        snapshot.metadata = SnapshotMetaData::new(Hash::new([3; 32]), 20, 0);
        files::write_snapshot(&snapshot, &local).unwrap();

        let mut config = ConsensusConfig {
            local_snapshots_base_path: local,
            ..Default::default()
        };
        assert_eq!(SnapshotProvider::load(&config).unwrap().initial_index(), 0);
        config.local_snapshots_enabled = true;
        assert_eq!(SnapshotProvider::load(&config).unwrap().initial_index(), 20);
    }

    #[test]
    fn test_patch_solid_entry_point() {
        let provider = SnapshotProvider::new(builtin_snapshot(&ConsensusConfig::default()));
        let hash = Hash::new([6; 32]);
        assert!(provider.patch_solid_entry_point(hash));
        assert!(!provider.patch_solid_entry_point(hash));
        assert!(provider.initial().has_solid_entry_point(&hash));
        assert!(provider.is_solid_entry_point(&hash));
    }

    #[test]
    fn test_replace_initial_keeps_latest_state() {
        let provider = SnapshotProvider::new(builtin_snapshot(&ConsensusConfig::default()));
        provider.latest_mut().metadata.index = 30;

        let mut next = builtin_snapshot(&ConsensusConfig::default());
        next.metadata = SnapshotMetaData::new(Hash::new([4; 32]), 25, 5);
        next.metadata.solid_entry_points.insert(Hash::new([5; 32]), 25);
        provider.replace_initial(next);

        assert_eq!(provider.initial_index(), 25);
        let latest = provider.latest();
        assert_eq!(latest.index(), 30);
        assert_eq!(latest.initial_index(), 25);
        assert!(latest.has_solid_entry_point(&Hash::new([5; 32])));
    }
}
