//! Advances the latest solid round and repairs the ledger when a round
//! cannot be applied.
//!
//! A round is only applied once it is closed: it lies before the clock's
//! round, or it is the clock's round and the clock is in its pause. A
//! missing round is filled in as empty once a later closed round is
//! present and solid.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tangle_metrics::MetricsRecorder;
use tangle_storage::Tangle;
use tangle_types::{Round, RoundClock};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::events::{ConsensusEvent, EventBus};
use crate::milestone::MilestoneService;
use crate::snapshot::SnapshotProvider;
use crate::transaction_validator::TransactionValidator;
use crate::worker::{StopFlag, Worker};

/// Applies a solid round to the ledger.
///
/// `Ok(false)` means the round's history was not consistent and nothing
/// was applied.
pub trait RoundLedger: Send + Sync {
    fn apply_round_to_ledger(&self, round: &Round) -> Result<bool, ConsensusError>;
}

/// Progress of an ongoing ledger repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairState {
    /// Round whose application failed first.
    pub error_round: u64,
    /// Rounds rolled back by the last repair. Zero while no repair runs.
    pub backoff_counter: u64,
}

pub struct LatestSolidMilestoneTracker {
    tangle: Arc<Tangle>,
    provider: Arc<SnapshotProvider>,
    validator: Arc<TransactionValidator>,
    milestones: Arc<MilestoneService>,
    ledger: Arc<dyn RoundLedger>,
    clock: Arc<dyn Clock>,
    round_clock: RoundClock,
    events: Arc<EventBus>,
    metrics: Arc<dyn MetricsRecorder>,
    repair: Mutex<RepairState>,
    interval: Duration,
}

impl std::fmt::Debug for LatestSolidMilestoneTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestSolidMilestoneTracker")
            .field("repair", &*self.repair.lock())
            .finish_non_exhaustive()
    }
}

impl LatestSolidMilestoneTracker {
    pub fn new(
        config: &ConsensusConfig,
        validator: Arc<TransactionValidator>,
        milestones: Arc<MilestoneService>,
        ledger: Arc<dyn RoundLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tangle: validator.tangle().clone(),
            provider: validator.snapshots().clone(),
            validator,
            milestones,
            ledger,
            clock,
            round_clock: config.round_clock(),
            events: Arc::new(EventBus::new()),
            metrics: tangle_metrics::noop(),
            repair: Mutex::new(RepairState::default()),
            interval: config.tracker_interval(),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn latest_solid_round(&self) -> u64 {
        self.provider.latest_index()
    }

    pub fn repair_state(&self) -> RepairState {
        *self.repair.lock()
    }

    fn is_round_closed(&self, index: u64, now: u64) -> bool {
        let current = self.round_clock.round(now);
        index < current || (index == current && !self.round_clock.is_round_active(now))
    }

    /// Apply every closed, solid round after the latest solid one.
    pub fn update_latest_solid_round(&self, stop: &StopFlag) -> Result<(), ConsensusError> {
        let now = self.clock.now_millis();
        let start = self.provider.latest_index();
        let mut solid = start;
        while !stop.is_stopped() && self.is_round_closed(solid + 1, now) {
            let next = solid + 1;
            let round = match self.tangle.round(next)? {
                Some(round) => round,
                None => match self.synthesize_empty_round(next, now)? {
                    Some(round) => round,
                    None => break,
                },
            };
            if !self.is_round_solid(&round)? {
                debug!(round = next, "waiting for round to become solid");
                break;
            }
            if !self.apply_solid_round(&round)? {
                break;
            }
            solid = self.provider.latest_index();
            if solid < next {
                break;
            }
        }

        let latest = self.provider.latest_index();
        if latest != start {
            info!(round = latest, "Latest solid round changed");
            self.metrics.set_latest_solid_round(latest);
            self.events.publish(ConsensusEvent::LatestSolidRoundChanged(latest));
        }
        Ok(())
    }

    /// A round nobody published a milestone for is stored empty once a
    /// later closed round is solid.
    fn synthesize_empty_round(&self, index: u64, now: u64) -> Result<Option<Round>, ConsensusError> {
        let current = self.round_clock.round(now);
        let Some(later) = self.tangle.closest_next_round(index, current)? else {
            return Ok(None);
        };
        if !self.is_round_closed(later.index, now) || !self.is_round_solid(&later)? {
            return Ok(None);
        }
        let empty = Round::new(index);
        self.tangle.put_round(&empty)?;
        debug!(round = index, "stored empty round");
        Ok(Some(empty))
    }

    fn is_round_solid(&self, round: &Round) -> Result<bool, ConsensusError> {
        for hash in &round.hashes {
            if !self.validator.is_solid(hash)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns `false` if the round failed and a repair was started.
    fn apply_solid_round(&self, round: &Round) -> Result<bool, ConsensusError> {
        let start = Instant::now();
        let applied = match self.ledger.apply_round_to_ledger(round) {
            Ok(applied) => applied,
            Err(e) => {
                error!(round = round.index, error = %e, "failed to apply round to ledger");
                false
            }
        };
        if !applied {
            self.metrics.record_ledger_application_failure(round.index);
            self.repair_corrupted_round(round)?;
            return Ok(false);
        }

        self.metrics
            .record_round_applied(round.index, start.elapsed().as_secs_f64());
        let mut repair = self.repair.lock();
        if repair.backoff_counter > 0 && round.index > repair.error_round {
            info!(error_round = repair.error_round, "Ledger repair complete");
            *repair = RepairState::default();
        }
        Ok(true)
    }

    /// Reset the last `backoff_counter` rounds up to the failing one, one
    /// more each time a round fails before the repair finishes.
    fn repair_corrupted_round(&self, round: &Round) -> Result<(), ConsensusError> {
        let state = {
            let mut repair = self.repair.lock();
            if repair.backoff_counter == 0 {
                repair.error_round = round.index;
            }
            repair.backoff_counter += 1;
            *repair
        };
        self.metrics
            .record_ledger_repair(state.error_round, state.backoff_counter);

        let first = (round.index + 1)
            .saturating_sub(state.backoff_counter)
            .max(self.provider.initial_index() + 1);
        warn!(
            round = round.index,
            error_round = state.error_round,
            backoff = state.backoff_counter,
            first,
            "Repairing ledger"
        );
        for index in first..=round.index {
            self.milestones.reset_corrupted_round(index)?;
        }
        Ok(())
    }
}

impl Worker for LatestSolidMilestoneTracker {
    fn name(&self) -> &'static str {
        "latest-solid-tracker"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&self, stop: &StopFlag) {
        if let Err(e) = self.update_latest_solid_round(stop) {
            error!(error = %e, "latest solid round update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle_validator::BundleValidator;
    use crate::clock::ManualClock;
    use crate::collaborators::NoopRequestQueue;
    use crate::snapshot::provider::builtin_snapshot;
    use crate::snapshot::SnapshotService;
    use std::collections::HashMap;
    use tangle_storage_memory::MemoryStore;
    use tangle_types::{Hash, TransactionBuilder};

    /// Replays rounds directly, failing the listed rounds a number of times.
    struct ScriptedLedger {
        snapshots: Arc<SnapshotService>,
        failures: Mutex<HashMap<u64, usize>>,
        applied: Mutex<Vec<u64>>,
    }

    impl RoundLedger for ScriptedLedger {
        fn apply_round_to_ledger(&self, round: &Round) -> Result<bool, ConsensusError> {
            if let Some(left) = self.failures.lock().get_mut(&round.index) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(false);
                }
            }
            self.snapshots.replay_latest(round.index)?;
            self.applied.lock().push(round.index);
            Ok(true)
        }
    }

    struct Fixture {
        tangle: Arc<Tangle>,
        tracker: LatestSolidMilestoneTracker,
        ledger: Arc<ScriptedLedger>,
        clock: Arc<ManualClock>,
    }

    const ROUND: u64 = 15_000;

    fn fixture(failures: HashMap<u64, usize>) -> Fixture {
        let config = ConsensusConfig {
            genesis_time: 0,
            round_duration: ROUND,
            round_pause: 5_000,
            ..ConsensusConfig::testnet()
        };
        let tangle = Arc::new(Tangle::new(Arc::new(MemoryStore::new())));
        let mut snapshot = builtin_snapshot(&config);
        snapshot.metadata.solid_entry_points.insert(Hash::NULL, 0);
        let provider = Arc::new(SnapshotProvider::new(snapshot));
        let clock = Arc::new(ManualClock::new(0));
        let validator = Arc::new(TransactionValidator::new(
            &config,
            tangle.clone(),
            provider.clone(),
            Arc::new(NoopRequestQueue),
            clock.clone(),
        ));
        let snapshots = Arc::new(SnapshotService::new(&config, tangle.clone(), provider.clone()));
        let milestones = Arc::new(MilestoneService::new(
            &config,
            tangle.clone(),
            provider,
            snapshots.clone(),
            Arc::new(BundleValidator::new(tangle.clone(), tangle_metrics::noop())),
        ));
        let ledger = Arc::new(ScriptedLedger {
            snapshots,
            failures: Mutex::new(failures),
            applied: Mutex::new(Vec::new()),
        });
        let tracker =
            LatestSolidMilestoneTracker::new(&config, validator, milestones, ledger.clone(), clock.clone());
        Fixture {
            tangle,
            tracker,
            ledger,
            clock,
        }
    }

    impl Fixture {
        fn empty_rounds(&self, indices: impl IntoIterator<Item = u64>) {
            for index in indices {
                self.tangle.put_round(&Round::new(index)).unwrap();
            }
        }

        fn tick(&self) {
            self.tracker
                .update_latest_solid_round(&StopFlag::new())
                .unwrap();
        }
    }

    #[test]
    fn test_open_round_is_not_applied() {
        let f = fixture(HashMap::new());
        f.empty_rounds(1..=3);
        // Active part of round 3.
        f.clock.set(3 * ROUND + 1_000);
        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 2);

        // Pause of round 3.
        f.clock.set(3 * ROUND + 11_000);
        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 3);
    }

    #[test]
    fn test_missing_round_is_filled_in() {
        let f = fixture(HashMap::new());
        f.empty_rounds([1, 3]);
        f.clock.set(10 * ROUND);
        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 3);
        assert!(f.tangle.round(2).unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_unsolid_milestone_blocks_round() {
        let f = fixture(HashMap::new());
        f.empty_rounds(1..=4);
        let parent = TransactionBuilder::new().nonce(1).build();
        let a = TransactionBuilder::new().nonce(2).trunk(&parent.hash()).build();
        let b = TransactionBuilder::new().nonce(3).build();
        for tx in [&a, &b] {
            f.tangle.store_transaction(tx, 0).unwrap();
        }
        f.tracker.validator.check_solidity(&b.hash()).unwrap();
        f.tangle
            .put_round(&Round::with_hashes(5, [a.hash(), b.hash()]))
            .unwrap();
        f.empty_rounds([6]);
        f.clock.set(10 * ROUND);

        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 4);

        f.tangle.store_transaction(&parent, 0).unwrap();
        f.tracker.validator.check_solidity(&parent.hash()).unwrap();
        f.tracker.validator.check_solidity(&a.hash()).unwrap();
        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 6);
    }

    #[test]
    fn test_repair_widens_until_past_error_round() {
        let f = fixture(HashMap::from([(7, 2)]));
        f.empty_rounds(1..=8);
        f.clock.set(20 * ROUND);

        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 6);
        assert_eq!(
            f.tracker.repair_state(),
            RepairState {
                error_round: 7,
                backoff_counter: 1
            }
        );

        f.tick();
        assert_eq!(f.tracker.repair_state().backoff_counter, 2);
        assert_eq!(f.tracker.latest_solid_round(), 5);

        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 8);
        assert_eq!(f.tracker.repair_state(), RepairState::default());
        let applied = f.ledger.applied.lock().clone();
        assert_eq!(applied, vec![1, 2, 3, 4, 5, 6, 6, 7, 8]);
    }

    #[test]
    fn test_repair_window_ends_at_latest_failure() {
        let f = fixture(HashMap::from([(7, 2), (6, 1)]));
        f.empty_rounds(1..=8);
        f.clock.set(20 * ROUND);

        f.tick();
        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 5);

        // Round 6 fails while round 7 is being repaired.
        f.tick();
        assert_eq!(
            f.tracker.repair_state(),
            RepairState {
                error_round: 7,
                backoff_counter: 3
            }
        );
        assert_eq!(f.tracker.latest_solid_round(), 3);

        f.tick();
        assert_eq!(f.tracker.latest_solid_round(), 8);
        assert_eq!(f.tracker.repair_state(), RepairState::default());
        let applied = f.ledger.applied.lock().clone();
        assert_eq!(applied, vec![1, 2, 3, 4, 5, 6, 4, 5, 6, 7, 8]);
    }
}
