//! Periodic local snapshots.
//!
//! While the node keeps up with the round clock a snapshot is taken every
//! `interval_synced` rounds past `depth`, otherwise every
//! `interval_unsynced` rounds. Leaving the synced state needs the ledger to
//! fall more than [`SYNC_BUFFER`] rounds behind, entering it needs the
//! ledger to catch up to the previous round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tangle_types::Snapshot;
use tracing::{debug, error, info};

use crate::config::ConsensusConfig;
use crate::error::SnapshotError;
use crate::milestone::MilestoneTracker;
use crate::snapshot::SnapshotService;
use crate::worker::{StopFlag, Worker};

/// Rounds the ledger may lag behind the clock before the node counts as
/// out of sync.
pub const SYNC_BUFFER: u64 = 5;

const RESCAN_INTERVAL: Duration = Duration::from_secs(10);

/// How far the node got with discovering rounds.
pub trait RoundProgress: Send + Sync {
    fn current_round(&self) -> u64;

    fn is_initial_scan_complete(&self) -> bool;
}

impl RoundProgress for MilestoneTracker {
    fn current_round(&self) -> u64 {
        MilestoneTracker::current_round(self)
    }

    fn is_initial_scan_complete(&self) -> bool {
        MilestoneTracker::is_initial_scan_complete(self)
    }
}

pub struct LocalSnapshotManager {
    snapshots: Arc<SnapshotService>,
    progress: Arc<dyn RoundProgress>,
    in_sync: AtomicBool,
    depth: u64,
    interval_synced: u64,
    interval_unsynced: u64,
}

impl std::fmt::Debug for LocalSnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSnapshotManager")
            .field("in_sync", &self.in_sync.load(Ordering::Relaxed))
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl LocalSnapshotManager {
    pub fn new(
        config: &ConsensusConfig,
        snapshots: Arc<SnapshotService>,
        progress: Arc<dyn RoundProgress>,
    ) -> Self {
        Self {
            snapshots,
            progress,
            in_sync: AtomicBool::new(false),
            depth: config.local_snapshots_depth,
            interval_synced: config.local_snapshots_interval_synced,
            interval_unsynced: config.local_snapshots_interval_unsynced,
        }
    }

    /// Update and return the sync state.
    pub fn is_in_sync(&self) -> bool {
        if !self.progress.is_initial_scan_complete() {
            self.in_sync.store(false, Ordering::Release);
            return false;
        }
        let lag = self
            .progress
            .current_round()
            .saturating_sub(self.snapshots.provider().latest_index());
        let was_in_sync = self.in_sync.load(Ordering::Acquire);
        let in_sync = if was_in_sync { lag <= SYNC_BUFFER } else { lag <= 1 };
        if in_sync != was_in_sync {
            debug!(in_sync, lag, "sync state changed");
            self.in_sync.store(in_sync, Ordering::Release);
        }
        in_sync
    }

    pub fn is_snapshot_due(&self, in_sync: bool) -> bool {
        let provider = self.snapshots.provider();
        let interval = if in_sync {
            self.interval_synced
        } else {
            self.interval_unsynced
        };
        provider.latest_index().saturating_sub(provider.initial_index()) > self.depth + interval
    }

    /// Take a local snapshot if one is due.
    pub fn check(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let in_sync = self.is_in_sync();
        if !self.is_snapshot_due(in_sync) {
            return Ok(None);
        }
        info!(in_sync, "Taking local snapshot");
        self.snapshots
            .take_local_snapshot(self.progress.current_round())
            .map(Some)
    }
}

impl Worker for LocalSnapshotManager {
    fn name(&self) -> &'static str {
        "local-snapshots"
    }

    fn interval(&self) -> Duration {
        RESCAN_INTERVAL
    }

    fn tick(&self, _stop: &StopFlag) {
        match self.check() {
            Ok(Some(snapshot)) => {
                if let Some(range) = self.snapshots.prunable_range(snapshot.index()) {
                    debug!(first = range.start(), last = range.end(), "rounds prunable");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "local snapshot failed"),
        }
    }
}
