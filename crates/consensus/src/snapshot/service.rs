//! Replay and rollback of round state diffs, and generation of new
//! snapshots with their solid entry points.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLockUpgradableReadGuard;
use tangle_metrics::MetricsRecorder;
use tangle_storage::{StorageError, Tangle};
use tangle_types::{Hash, Round, RoundClock, Snapshot, StateDiff};
use tracing::{debug, info, warn};

use crate::config::ConsensusConfig;
use crate::error::SnapshotError;
use crate::milestone::layout;
use crate::snapshot::{files, SnapshotProvider};

/// The aggregate of a replay, computed before taking the write lock.
#[derive(Debug)]
struct Replay {
    diff: StateDiff,
    last_applied: Option<Round>,
    skipped: Vec<u64>,
}

/// Moves snapshots between rounds and derives new initial snapshots.
pub struct SnapshotService {
    tangle: Arc<Tangle>,
    provider: Arc<SnapshotProvider>,
    metrics: Arc<dyn MetricsRecorder>,
    clock: RoundClock,
    security: usize,
    quorum: usize,
    solid_entry_point_lifetime: u64,
    outer_shell: u64,
    local_snapshots_depth: u64,
    pruning_delay: u64,
    milestone_start_index: u64,
    base_path: std::path::PathBuf,
}

impl std::fmt::Debug for SnapshotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotService")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl SnapshotService {
    pub fn new(config: &ConsensusConfig, tangle: Arc<Tangle>, provider: Arc<SnapshotProvider>) -> Self {
        Self {
            tangle,
            provider,
            metrics: tangle_metrics::noop(),
            clock: config.round_clock(),
            security: config.validator_security,
            quorum: config.quorum(),
            solid_entry_point_lifetime: config.solid_entry_point_lifetime,
            outer_shell: config.solid_entry_point_outer_shell,
            local_snapshots_depth: config.local_snapshots_depth,
            pruning_delay: config.local_snapshots_pruning_delay,
            milestone_start_index: config.milestone_start_index,
            base_path: config.local_snapshots_base_path.clone(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn provider(&self) -> &Arc<SnapshotProvider> {
        &self.provider
    }

    // ── Replay ───────────────────────────────────────────────────────

    fn accumulate(&self, snapshot: &Snapshot, target: u64) -> Result<Replay, SnapshotError> {
        let mut replay = Replay {
            diff: StateDiff::new(target, BTreeMap::new()),
            last_applied: None,
            skipped: Vec::new(),
        };
        let mut missing = Vec::new();
        for index in snapshot.index() + 1..=target {
            let Some(round) = self.tangle.round(index)? else {
                missing.push(index);
                continue;
            };
            if let Some(diff) = self.tangle.state_diff(index)? {
                replay.diff.merge(&diff);
            }
            replay.skipped.append(&mut missing);
            replay.last_applied = Some(round);
        }
        Ok(replay)
    }

    fn apply(&self, snapshot: &mut Snapshot, replay: Replay) -> Result<(), SnapshotError> {
        let Some(round) = replay.last_applied else {
            return Ok(());
        };
        if !replay.diff.is_consistent() || !snapshot.state.patched_state(&replay.diff).is_consistent()
        {
            return Err(SnapshotError::InconsistentState(round.index));
        }
        snapshot.state.apply_state_diff(&replay.diff)?;
        let rounds = round.index - snapshot.index();
        snapshot.metadata.index = round.index;
        snapshot.metadata.hash = round.snapshot_hash();
        snapshot.metadata.timestamp = self.clock.round_timestamp_secs(round.index);
        for index in replay.skipped {
            snapshot.add_skipped_round(index);
        }
        self.metrics.record_snapshot_replay(rounds);
        debug!(round = round.index, hash = %snapshot.hash(), "replayed rounds");
        Ok(())
    }

    /// Apply the state diffs of every stored round in
    /// `snapshot.index + 1 ..= target` at once.
    ///
    /// Indices without a round are recorded as skipped. The snapshot is
    /// unchanged if no round in the range exists or the aggregate diff would
    /// leave a negative balance.
    pub fn replay_milestones(&self, snapshot: &mut Snapshot, target: u64) -> Result<(), SnapshotError> {
        let replay = self.accumulate(snapshot, target)?;
        self.apply(snapshot, replay)
    }

    /// [`replay_milestones`](Self::replay_milestones) on the latest
    /// snapshot. Readers are only blocked while the aggregate is applied.
    pub fn replay_latest(&self, target: u64) -> Result<(), SnapshotError> {
        let latest = self.provider.latest_lock().upgradable_read();
        let replay = self.accumulate(&latest, target)?;
        let mut latest = RwLockUpgradableReadGuard::upgrade(latest);
        self.apply(&mut latest, replay)
    }

    // ── Rollback ─────────────────────────────────────────────────────

    /// Undo every round at or above `target`.
    ///
    /// Requires `initial_index < target <= snapshot.index`. On failure the
    /// snapshot is restored to its state before the call.
    pub fn roll_back_milestones(&self, snapshot: &mut Snapshot, target: u64) -> Result<(), SnapshotError> {
        if target <= snapshot.initial_index() || target > snapshot.index() {
            return Err(SnapshotError::InvalidRollbackTarget {
                target,
                initial: snapshot.initial_index(),
                latest: snapshot.index(),
            });
        }
        let backup = snapshot.clone();
        let rounds = snapshot.index() + 1 - target;
        while snapshot.index() >= target {
            if let Err(e) = self.roll_back_last_round(snapshot) {
                snapshot.update(&backup);
                return Err(e);
            }
        }
        self.metrics.record_snapshot_rollback(rounds);
        Ok(())
    }

    /// [`roll_back_milestones`](Self::roll_back_milestones) on the latest
    /// snapshot.
    pub fn roll_back_latest(&self, target: u64) -> Result<(), SnapshotError> {
        let mut latest = self.provider.latest_mut();
        self.roll_back_milestones(&mut latest, target)
    }

    fn roll_back_last_round(&self, snapshot: &mut Snapshot) -> Result<(), SnapshotError> {
        let index = snapshot.index();
        if let Some(diff) = self.tangle.state_diff(index)? {
            let inverse = diff.negated();
            if !inverse.is_consistent() || !snapshot.state.patched_state(&inverse).is_consistent() {
                warn!(round = index, "state diff cannot be rolled back");
                return Err(SnapshotError::InconsistentState(index));
            }
            snapshot.state.apply_state_diff(&inverse)?;
        }

        let mut current = index - 1;
        while current > snapshot.initial_index() && snapshot.remove_skipped_round(current) {
            current -= 1;
        }
        if current <= snapshot.initial_index() {
            snapshot.metadata.index = snapshot.metadata.initial_index;
            snapshot.metadata.hash = snapshot.metadata.initial_hash;
            snapshot.metadata.timestamp = snapshot.metadata.initial_timestamp;
            return Ok(());
        }
        let round = self
            .tangle
            .round(current)?
            .ok_or(SnapshotError::InconsistentState(current))?;
        snapshot.metadata.index = current;
        snapshot.metadata.hash = round.snapshot_hash();
        snapshot.metadata.timestamp = self.clock.round_timestamp_secs(current);
        Ok(())
    }

    // ── Snapshot generation ──────────────────────────────────────────

    /// The snapshot the ledger had right after `target` was applied, with
    /// fresh solid entry points and the rounds seen after it.
    pub fn generate_snapshot(&self, target: &Round, current_round: u64) -> Result<Snapshot, SnapshotError> {
        let (initial, latest) = {
            let initial = self.provider.initial();
            let latest = self.provider.latest();
            if target.index > latest.index() || target.index < initial.index() {
                return Err(SnapshotError::TargetOutOfRange {
                    target: target.index,
                    initial: initial.index(),
                    latest: latest.index(),
                });
            }
            (initial.clone(), latest.clone())
        };

        let mut snapshot = if target.index.abs_diff(initial.index()) <= target.index.abs_diff(latest.index()) {
            let mut snapshot = initial;
            self.replay_milestones(&mut snapshot, target.index)?;
            snapshot
        } else {
            let mut snapshot = latest;
            if target.index < snapshot.index() {
                self.roll_back_milestones(&mut snapshot, target.index + 1)?;
            }
            snapshot
        };
        snapshot.metadata.solid_entry_points = self.generate_solid_entry_points(target)?;
        snapshot.metadata.seen_rounds = self.generate_seen_rounds(target, current_round)?;
        Ok(snapshot)
    }

    /// Solid entry points for a snapshot at `target`.
    ///
    /// NULL is always one. Old entry points survive while they are younger
    /// than the lifetime and still needed; confirmed transactions of the
    /// outer shell of rounds below `target` become new ones.
    pub fn generate_solid_entry_points(&self, target: &Round) -> Result<HashMap<Hash, u64>, SnapshotError> {
        let mut entry_points = HashMap::from([(Hash::NULL, target.index)]);
        let confirmed = self.confirmed_tips(target)?;

        let (initial_index, old) = {
            let initial = self.provider.initial();
            (initial.index(), initial.metadata.solid_entry_points.clone())
        };
        for (hash, index) in old {
            if hash.is_null() || target.index.saturating_sub(index) > self.solid_entry_point_lifetime {
                continue;
            }
            if self.is_solid_entry_point(&hash, target.index, &confirmed)? {
                entry_points.insert(hash, index);
            }
        }

        let steps = target.index.saturating_sub(initial_index).min(self.outer_shell);
        let mut next = Some(target.clone());
        let mut step = 0;
        while let Some(round) = next.filter(|r| r.index > initial_index && step < steps) {
            for tip in layout::confirmed_tips(&self.tangle, &round, self.security, self.quorum)? {
                let mut visited = HashSet::new();
                let mut queue = VecDeque::from([tip]);
                while let Some(hash) = queue.pop_front() {
                    if !visited.insert(hash) {
                        continue;
                    }
                    let Some((tx, metadata)) = self.tangle.load(&hash)? else {
                        continue;
                    };
                    if metadata.snapshot_index < round.index {
                        continue;
                    }
                    if self.is_solid_entry_point(&hash, target.index, &confirmed)? {
                        entry_points.insert(hash, target.index);
                    }
                    queue.push_back(tx.trunk());
                    queue.push_back(tx.branch());
                }
                entry_points.insert(tip, target.index);
            }
            next = self.tangle.closest_prev_round(round.index - 1, initial_index)?;
            step += 1;
        }
        Ok(entry_points)
    }

    fn confirmed_tips(&self, round: &Round) -> Result<Vec<(Hash, u64)>, StorageError> {
        let mut tips = Vec::new();
        for hash in layout::confirmed_tips(&self.tangle, round, self.security, self.quorum)? {
            if let Some(tx) = self.tangle.transaction(&hash)? {
                tips.push((hash, tx.timestamp()));
            }
        }
        Ok(tips)
    }

    /// Whether `hash` must stay a traversal boundary after a snapshot at
    /// `target_index`: it has an approver confirmed later, or an
    /// unconfirmed approver that is not orphaned from the perspective of a
    /// confirmed tip.
    fn is_solid_entry_point(
        &self,
        hash: &Hash,
        target_index: u64,
        confirmed_tips: &[(Hash, u64)],
    ) -> Result<bool, StorageError> {
        let mut unconfirmed = Vec::new();
        for approver in self.tangle.approvers(hash)? {
            let Some(metadata) = self.tangle.metadata(&approver)? else {
                continue;
            };
            if metadata.snapshot_index > target_index {
                return Ok(true);
            }
            if metadata.snapshot_index == 0 {
                unconfirmed.push(approver);
            }
        }
        let mut processed = HashSet::new();
        for approver in &unconfirmed {
            for (_, timestamp) in confirmed_tips {
                if !self.is_orphaned(approver, *timestamp, &mut processed)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// A transaction is orphaned if neither it nor anything approving it
    /// arrived after `reference_secs`.
    pub fn is_orphaned(
        &self,
        hash: &Hash,
        reference_secs: u64,
        processed: &mut HashSet<Hash>,
    ) -> Result<bool, StorageError> {
        let mut queue = VecDeque::from([*hash]);
        while let Some(current) = queue.pop_front() {
            if !processed.insert(current) {
                continue;
            }
            let Some(metadata) = self.tangle.metadata(&current)? else {
                continue;
            };
            if metadata.arrival_time / 1000 > reference_secs {
                return Ok(false);
            }
            queue.extend(self.tangle.approvers(&current)?);
        }
        Ok(true)
    }

    /// Rounds stored after `target` up to `current_round`, with their
    /// milestones.
    pub fn generate_seen_rounds(
        &self,
        target: &Round,
        current_round: u64,
    ) -> Result<HashMap<u64, Vec<Hash>>, SnapshotError> {
        let mut seen = HashMap::new();
        let mut index = target.index;
        while let Some(round) = self.tangle.closest_next_round(index, current_round)? {
            index = round.index;
            seen.insert(round.index, round.hashes.into_iter().collect());
        }
        Ok(seen)
    }

    // ── Local snapshots ──────────────────────────────────────────────

    /// The newest stored round at least `depth` rounds below the latest
    /// snapshot.
    pub fn local_snapshot_target(&self) -> Result<Round, SnapshotError> {
        let index = self
            .provider
            .latest_index()
            .saturating_sub(self.local_snapshots_depth);
        self.tangle
            .closest_prev_round(index, self.provider.initial_index())?
            .ok_or(SnapshotError::NoTargetRound(index))
    }

    /// Generate a snapshot at the local snapshot target, write it to the
    /// configured base path and make it the new initial snapshot.
    pub fn take_local_snapshot(&self, current_round: u64) -> Result<Snapshot, SnapshotError> {
        let start = Instant::now();
        let target = self.local_snapshot_target()?;
        let snapshot = self.generate_snapshot(&target, current_round)?;
        files::write_snapshot(&snapshot, &self.base_path)?;
        self.provider.replace_initial(snapshot.clone());
        self.metrics.record_local_snapshot(
            snapshot.index(),
            snapshot.metadata.solid_entry_points.len(),
            start.elapsed().as_secs_f64(),
        );
        info!(
            round = snapshot.index(),
            solid_entry_points = snapshot.metadata.solid_entry_points.len(),
            seen_rounds = snapshot.metadata.seen_rounds.len(),
            "Local snapshot taken"
        );
        Ok(snapshot)
    }

    /// Rounds whose data may be pruned once the initial snapshot sits at
    /// `initial_index`, `None` if nothing is old enough yet.
    pub fn prunable_range(&self, initial_index: u64) -> Option<RangeInclusive<u64>> {
        let first = self.milestone_start_index + 1;
        let last = initial_index.checked_sub(self.pruning_delay)?;
        (last >= first).then_some(first..=last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::provider::builtin_snapshot;
    use tangle_storage_memory::MemoryStore;
    use tangle_types::{TransactionBuilder, SUPPLY};

    fn addr(n: u8) -> Hash {
        Hash::new([n; 32])
    }

    fn service() -> SnapshotService {
        let config = ConsensusConfig {
            genesis_address: addr(1),
            ..ConsensusConfig::testnet()
        };
        let tangle = Arc::new(Tangle::new(Arc::new(MemoryStore::new())));
        let provider = Arc::new(SnapshotProvider::new(builtin_snapshot(&config)));
        SnapshotService::new(&config, tangle, provider)
    }

    /// Round `index` moving `amount` from `from` to `to`.
    fn transfer_round(service: &SnapshotService, index: u64, from: u8, to: u8, amount: i64) {
        let round = Round::with_hashes(index, [Hash::new([index as u8 + 100; 32])]);
        service.tangle.put_round(&round).unwrap();
        service
            .tangle
            .put_state_diff(&StateDiff::new(index, [(addr(from), -amount), (addr(to), amount)].into()))
            .unwrap();
    }

    #[test]
    fn test_replay_advances_metadata() {
        let service = service();
        transfer_round(&service, 1, 1, 2, 10);
        transfer_round(&service, 3, 2, 3, 4);

        service.replay_latest(5).unwrap();
        let latest = service.provider.latest();
        assert_eq!(latest.index(), 3);
        assert_eq!(latest.hash(), service.tangle.round(3).unwrap().unwrap().snapshot_hash());
        assert_eq!(latest.timestamp(), service.clock.round_timestamp_secs(3));
        assert_eq!(latest.state.balance(&addr(1)), Some(SUPPLY - 10));
        assert_eq!(latest.state.balance(&addr(2)), Some(6));
        assert_eq!(latest.state.balance(&addr(3)), Some(4));
        assert_eq!(latest.skipped_rounds().iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_replay_rejects_negative_balance() {
        let service = service();
        transfer_round(&service, 1, 2, 3, 10);
        assert!(matches!(
            service.replay_latest(1),
            Err(SnapshotError::InconsistentState(1))
        ));
        assert_eq!(service.provider.latest_index(), 0);
    }

    #[test]
    fn test_rollback_restores_previous_round() {
        let service = service();
        transfer_round(&service, 1, 1, 2, 10);
        transfer_round(&service, 3, 2, 3, 4);

        let mut expected = service.provider.latest().clone();
        service.replay_milestones(&mut expected, 1).unwrap();

        service.replay_latest(3).unwrap();
        service.roll_back_latest(3).unwrap();
        assert_eq!(*service.provider.latest(), expected);

        service.roll_back_latest(1).unwrap();
        assert_eq!(*service.provider.latest(), *service.provider.initial());
    }

    #[test]
    fn test_rollback_target_must_be_in_range() {
        let service = service();
        transfer_round(&service, 1, 1, 2, 10);
        service.replay_latest(1).unwrap();
        assert!(matches!(
            service.roll_back_latest(0),
            Err(SnapshotError::InvalidRollbackTarget { .. })
        ));
        assert!(matches!(
            service.roll_back_latest(2),
            Err(SnapshotError::InvalidRollbackTarget { .. })
        ));
    }

    #[test]
    fn test_failed_rollback_restores_snapshot() {
        let service = service();
        transfer_round(&service, 1, 1, 2, 10);
        transfer_round(&service, 2, 2, 3, 10);
        service.replay_latest(2).unwrap();
        // Corrupt round 1's diff so undoing it would drive address 2 negative.
        service
            .tangle
            .put_state_diff(&StateDiff::new(1, [(addr(1), -50), (addr(2), 50)].into()))
            .unwrap();

        let before = service.provider.latest().clone();
        assert!(service.roll_back_latest(1).is_err());
        assert_eq!(*service.provider.latest(), before);
    }

    #[test]
    fn test_orphaned_unless_something_arrived_later() {
        let service = service();
        let old = TransactionBuilder::new().nonce(1).build();
        let child = TransactionBuilder::new().nonce(2).trunk(&old.hash()).build();
        service.tangle.store_transaction(&old, 1_000_000).unwrap();

        let mut processed = HashSet::new();
        assert!(service.is_orphaned(&old.hash(), 1_000, &mut processed).unwrap());

        service.tangle.store_transaction(&child, 5_000_000).unwrap();
        let mut processed = HashSet::new();
        assert!(!service.is_orphaned(&old.hash(), 1_000, &mut processed).unwrap());
    }

    #[test]
    fn test_seen_rounds_after_target() {
        let service = service();
        for index in [2, 4, 9] {
            transfer_round(&service, index, 1, 2, 1);
        }
        let target = service.tangle.round(2).unwrap().unwrap();
        let seen = service.generate_seen_rounds(&target, 5).unwrap();
        let mut indices: Vec<_> = seen.keys().copied().collect();
        indices.sort();
        assert_eq!(indices, vec![4]);
        assert_eq!(seen[&4], vec![Hash::new([104; 32])]);
    }

    #[test]
    fn test_prunable_range() {
        let service = service();
        assert_eq!(service.prunable_range(100), None);
        assert_eq!(service.prunable_range(50_010), Some(1..=10));
    }
}
