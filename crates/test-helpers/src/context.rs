//! A consensus core wired over the in-memory store.

use std::sync::Arc;

use dashmap::DashMap;
use tangle_consensus::{
    BundleValidator, ConsensusConfig, EventBus, LatestSolidMilestoneTracker, LedgerService,
    ManualClock, MilestoneService, MilestoneSolidifier, MilestoneTracker, RequestQueue,
    SnapshotProvider, SnapshotService, SolidityPropagator, StopFlag, TransactionValidator,
    ValidatorSchedule,
};
use tangle_storage::Tangle;
use tangle_storage_memory::MemoryStore;
use tangle_types::{Hash, Round, Transaction};

use crate::fixtures::genesis_address;
use crate::{TestValidators, TEST_KEY_DEPTH, TEST_SECURITY};

/// Round length of test contexts (ms).
pub const TEST_ROUND_DURATION: u64 = 15_000;

/// Records every request. The stored flag is whether any request for the
/// hash was milestone related.
#[derive(Debug, Default)]
pub struct RecordingRequestQueue {
    requested: DashMap<Hash, bool>,
}

impl RecordingRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_requested(&self, hash: &Hash) -> bool {
        self.requested.contains_key(hash)
    }

    pub fn was_requested_for_milestone(&self, hash: &Hash) -> bool {
        self.requested.get(hash).is_some_and(|entry| *entry)
    }

    pub fn len(&self) -> usize {
        self.requested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }
}

impl RequestQueue for RecordingRequestQueue {
    fn enqueue_transaction(&self, hash: &Hash, milestone: bool) {
        let mut entry = self.requested.entry(*hash).or_insert(false);
        *entry |= milestone;
    }

    fn is_transaction_requested(&self, hash: &Hash, milestone: bool) -> bool {
        self.requested
            .get(hash)
            .is_some_and(|entry| *entry || !milestone)
    }
}

/// Every consensus component, built in dependency order.
pub struct TestContext {
    pub config: ConsensusConfig,
    pub validators: TestValidators,
    pub tangle: Arc<Tangle>,
    pub provider: Arc<SnapshotProvider>,
    pub clock: Arc<ManualClock>,
    pub requests: Arc<RecordingRequestQueue>,
    pub events: Arc<EventBus>,
    pub transactions: Arc<TransactionValidator>,
    pub bundles: Arc<BundleValidator>,
    pub snapshots: Arc<SnapshotService>,
    pub milestones: Arc<MilestoneService>,
    pub solidifier: Arc<MilestoneSolidifier>,
    pub schedule: Arc<ValidatorSchedule>,
    pub tracker: Arc<MilestoneTracker>,
    pub ledger: Arc<LedgerService>,
    pub latest_solid: Arc<LatestSolidMilestoneTracker>,
    pub propagator: Arc<SolidityPropagator>,
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("validators", &self.validators)
            .field("latest_index", &self.provider.latest_index())
            .finish_non_exhaustive()
    }
}

impl TestContext {
    /// A context with `validators` validators, genesis at time 0 and the
    /// whole supply on [`genesis_address`].
    pub fn new(validators: usize) -> Self {
        let validators = TestValidators::new(validators, 42);
        let config = Self::config_for(&validators);
        Self::with_config(config, validators)
    }

    /// The configuration [`new`](Self::new) uses for `validators`.
    pub fn config_for(validators: &TestValidators) -> ConsensusConfig {
        ConsensusConfig {
            genesis_time: 0,
            round_duration: TEST_ROUND_DURATION,
            round_pause: 5_000,
            validator_security: TEST_SECURITY,
            milestone_key_depth: TEST_KEY_DEPTH,
            number_of_active_validators: validators.size(),
            initial_validators: validators.addresses(),
            genesis_address: genesis_address(),
            ..ConsensusConfig::testnet()
        }
    }

    pub fn with_config(config: ConsensusConfig, validators: TestValidators) -> Self {
        let tangle = Arc::new(Tangle::new(Arc::new(MemoryStore::new())));
        Self::on_tangle(config, validators, tangle)
    }

    /// Wire a context over an existing tangle, as a restarted node would.
    pub fn on_tangle(config: ConsensusConfig, validators: TestValidators, tangle: Arc<Tangle>) -> Self {
        let provider = Arc::new(SnapshotProvider::load(&config).expect("builtin snapshot"));
        let clock = Arc::new(ManualClock::new(0));
        let requests = Arc::new(RecordingRequestQueue::new());
        let events = Arc::new(EventBus::new());

        let transactions = Arc::new(
            TransactionValidator::new(
                &config,
                tangle.clone(),
                provider.clone(),
                requests.clone(),
                clock.clone(),
            )
            .with_events(events.clone()),
        );
        let bundles = Arc::new(BundleValidator::new(tangle.clone(), tangle_metrics::noop()));
        let snapshots = Arc::new(SnapshotService::new(&config, tangle.clone(), provider.clone()));
        let milestones = Arc::new(MilestoneService::new(
            &config,
            tangle.clone(),
            provider.clone(),
            snapshots.clone(),
            bundles.clone(),
        ));
        let solidifier = Arc::new(MilestoneSolidifier::new(&config, transactions.clone()));
        let schedule = Arc::new(ValidatorSchedule::new(config.initial_validators.clone()));
        let tracker = Arc::new(
            MilestoneTracker::new(
                &config,
                transactions.clone(),
                milestones.clone(),
                solidifier.clone(),
                schedule.clone(),
                clock.clone(),
            )
            .with_events(events.clone()),
        );
        let ledger = Arc::new(LedgerService::new(
            &config,
            transactions.clone(),
            bundles.clone(),
            milestones.clone(),
            snapshots.clone(),
            requests.clone(),
        ));
        let latest_solid = Arc::new(
            LatestSolidMilestoneTracker::new(
                &config,
                transactions.clone(),
                milestones.clone(),
                ledger.clone(),
                clock.clone(),
            )
            .with_events(events.clone()),
        );
        let propagator = Arc::new(SolidityPropagator::new(
            transactions.clone(),
            tangle_metrics::noop(),
            config.propagation_interval(),
            config.propagation_scan_limit,
        ));

        Self {
            config,
            validators,
            tangle,
            provider,
            clock,
            requests,
            events,
            transactions,
            bundles,
            snapshots,
            milestones,
            solidifier,
            schedule,
            tracker,
            ledger,
            latest_solid,
            propagator,
        }
    }

    pub fn store(&self, txs: &[Transaction]) {
        for tx in txs {
            self.tangle.store_transaction(tx, 0).expect("in-memory store");
        }
    }

    /// One second into the open part of round `index` (ms).
    pub fn time_in_round(&self, index: u64) -> u64 {
        self.config.genesis_time + index * self.config.round_duration + 1_000
    }

    /// Move the clock past the end of round `index`.
    pub fn close_round(&self, index: u64) {
        self.clock
            .set(self.config.genesis_time + (index + 1) * self.config.round_duration + 1_000);
    }

    /// Build, store and process a milestone of validator `idx` for `round`
    /// confirming `tips`. Returns the bundle, tail first.
    pub fn publish_milestone(&self, idx: usize, round: u64, tips: Vec<Hash>) -> Vec<Transaction> {
        let previous_root = match round.checked_sub(1) {
            Some(prev) => self
                .tangle
                .round(prev)
                .expect("in-memory store")
                .map_or(Hash::NULL, |r| r.merkle_root()),
            None => Hash::NULL,
        };
        let bundle = self.validators.milestone_after(
            idx,
            round,
            self.time_in_round(round),
            tips,
            previous_root,
        );
        self.store(&bundle);
        self.tracker
            .process_milestone_candidate(&bundle[0])
            .expect("milestone processing");
        bundle
    }

    /// Run the deep solidity check the solidifier would run.
    pub fn solidify(&self, hash: &Hash) -> bool {
        self.transactions
            .check_solidity_deep(hash, true, 100_000)
            .expect("in-memory store")
    }

    /// Solidify every milestone of `round`.
    pub fn solidify_round(&self, index: u64) -> bool {
        let round = self
            .tangle
            .round(index)
            .expect("in-memory store")
            .unwrap_or_else(|| Round::new(index));
        round.hashes.iter().all(|hash| self.solidify(hash))
    }

    /// One tick of the latest solid milestone tracker.
    pub fn advance_ledger(&self) {
        self.latest_solid
            .update_latest_solid_round(&StopFlag::new())
            .expect("ledger update");
    }
}
