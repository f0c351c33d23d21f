//! Discovers milestones published by the active validators.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tangle_metrics::MetricsRecorder;
use tangle_types::{Hash, Round, RoundClock, Transaction};
use tracing::{debug, error, info, trace};

use crate::clock::Clock;
use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::events::{ConsensusEvent, EventBus};
use crate::milestone::layout;
use crate::milestone::nominee::ValidatorSchedule;
use crate::milestone::service::{MilestoneService, MilestoneValidity};
use crate::milestone::solidifier::MilestoneSolidifier;
use crate::transaction_validator::TransactionValidator;
use crate::worker::{StopFlag, Worker};

/// Follows the round clock, collects candidates from the validators'
/// addresses and records valid milestones in their rounds.
pub struct MilestoneTracker {
    validator: Arc<TransactionValidator>,
    service: Arc<MilestoneService>,
    solidifier: Arc<MilestoneSolidifier>,
    schedule: Arc<ValidatorSchedule>,
    clock: Arc<dyn Clock>,
    round_clock: RoundClock,
    events: Arc<EventBus>,
    metrics: Arc<dyn MetricsRecorder>,

    current_round: AtomicU64,
    round_started: AtomicBool,
    validators: RwLock<Arc<HashSet<Hash>>>,
    seen: Mutex<HashSet<Hash>>,
    candidates: Mutex<VecDeque<Hash>>,
    initial_scan_complete: AtomicBool,

    batch_size: usize,
    interval: Duration,
}

impl std::fmt::Debug for MilestoneTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MilestoneTracker")
            .field("current_round", &self.current_round())
            .field("candidates", &self.candidates.lock().len())
            .finish_non_exhaustive()
    }
}

impl MilestoneTracker {
    pub fn new(
        config: &ConsensusConfig,
        validator: Arc<TransactionValidator>,
        service: Arc<MilestoneService>,
        solidifier: Arc<MilestoneSolidifier>,
        schedule: Arc<ValidatorSchedule>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let validators = schedule.validators_for_round(0);
        Self {
            validator,
            service,
            solidifier,
            schedule,
            clock,
            round_clock: config.round_clock(),
            events: Arc::new(EventBus::new()),
            metrics: tangle_metrics::noop(),
            current_round: AtomicU64::new(0),
            round_started: AtomicBool::new(false),
            validators: RwLock::new(validators),
            seen: Mutex::new(HashSet::new()),
            candidates: Mutex::new(VecDeque::new()),
            initial_scan_complete: AtomicBool::new(false),
            batch_size: config.milestone_batch_size.max(1),
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

    pub fn current_round(&self) -> u64 {
        self.current_round.load(Ordering::Acquire)
    }

    pub fn round_clock(&self) -> &RoundClock {
        &self.round_clock
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether the first full scan of the validators' addresses finished.
    pub fn is_initial_scan_complete(&self) -> bool {
        self.initial_scan_complete.load(Ordering::Acquire)
    }

    pub fn validators(&self) -> Arc<HashSet<Hash>> {
        Arc::clone(&self.validators.read())
    }

    /// Advance to the clock's round, switching validator sets when a
    /// scheduled set takes effect. Returns whether the round changed.
    pub fn refresh_round(&self) -> bool {
        let round = self.round_clock.round(self.clock.now_millis());
        let started = self.round_started.swap(true, Ordering::AcqRel);
        if started && round == self.current_round() {
            return false;
        }
        *self.validators.write() = self.schedule.validators_for_round(round);
        self.current_round.store(round, Ordering::Release);
        self.metrics.set_current_round(round);
        self.events.publish(ConsensusEvent::RoundChanged(round));
        debug!(round, "round changed");
        true
    }

    /// Queue the validators' transactions not looked at before. Returns
    /// the number queued.
    pub fn collect_candidates(&self) -> Result<usize, ConsensusError> {
        let tangle = self.validator.tangle();
        let mut queued = 0;
        for address in self.validators().iter() {
            for hash in tangle.address_transactions(address)? {
                if self.seen.lock().insert(hash) {
                    self.candidates.lock().push_back(hash);
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }

    /// Process up to one batch of queued candidates. Candidates that could
    /// not be decided yet go back to the queue.
    pub fn process_candidates(&self, stop: &StopFlag) -> Result<usize, ConsensusError> {
        let batch: Vec<Hash> = {
            let mut candidates = self.candidates.lock();
            let take = candidates.len().min(self.batch_size);
            candidates.drain(..take).collect()
        };
        let mut retry = Vec::new();
        let mut processed = 0;
        let mut pending = batch.into_iter();
        for hash in pending.by_ref() {
            if stop.is_stopped() {
                retry.push(hash);
                break;
            }
            let Some(tx) = self.validator.tangle().transaction(&hash)? else {
                continue;
            };
            if self.process_milestone_candidate(&tx)? {
                processed += 1;
            } else {
                retry.push(hash);
            }
        }
        retry.extend(pending);
        self.candidates.lock().extend(retry);
        Ok(processed)
    }

    /// Decide one candidate. Returns `false` if it has to be looked at
    /// again once more of its bundle arrived.
    pub fn process_milestone_candidate(&self, tx: &Transaction) -> Result<bool, ConsensusError> {
        let round_index = tx.round_index();
        let validators = self.schedule.validators_for_round(round_index);
        if !validators.contains(&tx.address()) || tx.current_index() != 0 {
            return Ok(true);
        }
        if round_index <= self.validator.snapshots().initial_index() {
            return Ok(true);
        }

        let hash = tx.hash();
        let validity = self
            .service
            .validate_validator_milestone(tx, round_index, &validators)?;
        self.metrics.record_milestone_candidate(validity.as_str());
        match validity {
            MilestoneValidity::Valid => {
                if self.is_in_round_window(tx, round_index) && self.add_to_round(tx, round_index)? {
                    if !self.validator.check_solidity(&hash)? {
                        self.solidifier.add(hash, round_index);
                    }
                    info!(round = round_index, hash = %hash, "Milestone accepted");
                    self.events.publish(ConsensusEvent::MilestoneAccepted {
                        round: round_index,
                        hash,
                    });
                }
                Ok(true)
            }
            MilestoneValidity::Incomplete => {
                self.solidifier.add(hash, round_index);
                self.validator
                    .tangle()
                    .update_metadata(&hash, |m| m.milestone = true)?;
                Ok(false)
            }
            MilestoneValidity::Invalid => Ok(true),
        }
    }

    fn is_in_round_window(&self, tx: &Transaction, round_index: u64) -> bool {
        let attached = tx.attachment_timestamp();
        let in_window =
            self.round_clock.round(attached) == round_index && self.round_clock.is_round_active(attached);
        if !in_window {
            trace!(hash = %tx.hash(), round = round_index, attached, "milestone outside its round window");
        }
        in_window
    }

    /// Record `tx` in round `round_index` unless its validator already has
    /// a milestone there, then assign the round to what it references.
    fn add_to_round(&self, tx: &Transaction, round_index: u64) -> Result<bool, ConsensusError> {
        let tangle = self.validator.tangle();
        let mut round = tangle.round(round_index)?.unwrap_or_else(|| Round::new(round_index));
        if round.contains(&tx.hash()) {
            return Ok(true);
        }
        for milestone in &round.hashes {
            if tangle
                .transaction(milestone)?
                .is_some_and(|other| other.address() == tx.address())
            {
                debug!(round = round_index, address = %tx.address(), "validator already has a milestone in this round");
                return Ok(false);
            }
        }
        round.add_milestone(tx.hash());
        tangle.put_round(&round)?;

        let snapshots = self.validator.snapshots();
        let tips = self.service.confirmed_tips(round_index)?;
        let referenced = layout::referenced_transactions(tangle, round_index, tips, |hash| {
            snapshots.is_solid_entry_point(hash)
        })?;
        for hash in referenced {
            tangle.update_metadata(&hash, |m| m.round_index = round_index)?;
        }
        Ok(true)
    }

    /// One tracker pass. The initial scan is complete after the first pass
    /// that leaves no candidate undecided.
    pub fn track(&self, stop: &StopFlag) -> Result<(), ConsensusError> {
        self.refresh_round();
        self.collect_candidates()?;
        self.process_candidates(stop)?;
        if self.candidates.lock().is_empty()
            && !self.initial_scan_complete.swap(true, Ordering::AcqRel)
        {
            info!(round = self.current_round(), "Initial milestone scan complete");
        }
        Ok(())
    }
}

impl Worker for MilestoneTracker {
    fn name(&self) -> &'static str {
        "milestone-tracker"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&self, stop: &StopFlag) {
        if let Err(e) = self.track(stop) {
            error!(error = %e, "milestone tracking failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle_validator::BundleValidator;
    use crate::clock::ManualClock;
    use crate::collaborators::NoopRequestQueue;
    use crate::milestone::layout::MilestoneBundleBuilder;
    use crate::snapshot::provider::builtin_snapshot;
    use crate::snapshot::{SnapshotProvider, SnapshotService};
    use tangle_storage::Tangle;
    use tangle_storage_memory::MemoryStore;
    use tangle_types::{MerkleKeyTree, TransactionBuilder};

    struct Fixture {
        tangle: Arc<Tangle>,
        tracker: MilestoneTracker,
        solidifier: Arc<MilestoneSolidifier>,
        clock: Arc<ManualClock>,
        keys: Vec<MerkleKeyTree>,
        events: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let keys: Vec<MerkleKeyTree> = (1..=2u8)
            .map(|seed| MerkleKeyTree::generate(&[seed; 32], 3, 1).unwrap())
            .collect();
        let config = ConsensusConfig {
            genesis_time: 0,
            round_duration: 15_000,
            round_pause: 5_000,
            validator_security: 1,
            milestone_key_depth: 3,
            number_of_active_validators: 2,
            initial_validators: keys.iter().map(MerkleKeyTree::root).collect(),
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
        let bundles = Arc::new(BundleValidator::new(tangle.clone(), tangle_metrics::noop()));
        let snapshots = Arc::new(SnapshotService::new(&config, tangle.clone(), provider.clone()));
        let service = Arc::new(MilestoneService::new(
            &config,
            tangle.clone(),
            provider,
            snapshots,
            bundles,
        ));
        let solidifier = Arc::new(MilestoneSolidifier::new(&config, validator.clone()));
        let schedule = Arc::new(ValidatorSchedule::new(config.initial_validators.clone()));
        let events = Arc::new(EventBus::new());
        let tracker = MilestoneTracker::new(
            &config,
            validator,
            service,
            solidifier.clone(),
            schedule,
            clock.clone(),
        )
        .with_events(events.clone());
        Fixture {
            tangle,
            tracker,
            solidifier,
            clock,
            keys,
            events,
        }
    }

    impl Fixture {
        fn milestone(&self, key: usize, round: u64, attached: u64, tips: Vec<Hash>) -> Vec<Transaction> {
            MilestoneBundleBuilder::new(round)
                .tips(tips)
                .attachment_timestamp(attached)
                .build(&self.keys[key])
                .unwrap()
        }

        fn store(&self, txs: &[Transaction]) {
            for tx in txs {
                self.tangle.store_transaction(tx, 0).unwrap();
            }
        }
    }

    #[test]
    fn test_refresh_round_publishes_changes() {
        let f = fixture();
        let events = f.events.subscribe();
        assert!(f.tracker.refresh_round());
        assert!(!f.tracker.refresh_round());
        f.clock.set(31_000);
        assert!(f.tracker.refresh_round());
        assert_eq!(f.tracker.current_round(), 2);
        assert_eq!(events.try_recv().unwrap(), ConsensusEvent::RoundChanged(0));
        assert_eq!(events.try_recv().unwrap(), ConsensusEvent::RoundChanged(2));
    }

    #[test]
    fn test_valid_milestone_is_added_to_round() {
        let f = fixture();
        let tip = TransactionBuilder::new().nonce(5).build();
        f.store(&[tip.clone()]);
        let bundle = f.milestone(0, 2, 31_000, vec![tip.hash()]);
        f.store(&bundle);
        f.clock.set(32_000);

        f.tracker.track(&StopFlag::new()).unwrap();
        let round = f.tangle.round(2).unwrap().unwrap();
        assert!(round.contains(&bundle[0].hash()));
        assert_eq!(f.tangle.metadata(&tip.hash()).unwrap().unwrap().round_index, 2);
        assert!(f.tracker.is_initial_scan_complete());
    }

    #[test]
    fn test_milestone_outside_window_is_dropped() {
        let f = fixture();
        // Attached during the pause of round 2.
        let bundle = f.milestone(0, 2, 42_000, Vec::new());
        f.store(&bundle);
        assert!(f.tracker.process_milestone_candidate(&bundle[0]).unwrap());
        assert!(f.tangle.round(2).unwrap().is_none());
    }

    #[test]
    fn test_one_milestone_per_validator_and_round() {
        let f = fixture();
        let first = f.milestone(0, 2, 31_000, vec![Hash::new([1; 32])]);
        let second = f.milestone(0, 2, 32_000, vec![Hash::new([2; 32])]);
        let other = f.milestone(1, 2, 33_000, Vec::new());
        f.store(&first);
        f.store(&second);
        f.store(&other);
        for bundle in [&first, &second, &other] {
            assert!(f.tracker.process_milestone_candidate(&bundle[0]).unwrap());
        }
        let round = f.tangle.round(2).unwrap().unwrap();
        assert_eq!(round.hashes.len(), 2);
        assert!(round.contains(&first[0].hash()));
        assert!(round.contains(&other[0].hash()));
    }

    #[test]
    fn test_incomplete_milestone_is_requeued() {
        let f = fixture();
        let bundle = f.milestone(0, 3, 46_000, vec![Hash::new([1; 32])]);
        f.store(&bundle[..1]);

        f.tracker.track(&StopFlag::new()).unwrap();
        assert!(f.tangle.round(3).unwrap().is_none());
        assert_eq!(f.solidifier.len(), 1);
        assert!(f.tangle.metadata(&bundle[0].hash()).unwrap().unwrap().milestone);
        assert!(!f.tracker.is_initial_scan_complete());

        f.store(&bundle[1..]);
        f.tracker.track(&StopFlag::new()).unwrap();
        assert!(f.tangle.round(3).unwrap().unwrap().contains(&bundle[0].hash()));
    }

    #[test]
    fn test_foreign_and_non_tail_transactions_are_ignored() {
        let f = fixture();
        let stranger = TransactionBuilder::new().nonce(1).round_index(2).build();
        assert!(f.tracker.process_milestone_candidate(&stranger).unwrap());
        let bundle = f.milestone(0, 2, 31_000, Vec::new());
        f.store(&bundle);
        assert!(f.tracker.process_milestone_candidate(&bundle[1]).unwrap());
        assert!(f.tangle.round(2).unwrap().is_none());
    }
}
