//! Construction of the consensus components in dependency order.

use std::sync::Arc;

use tangle_consensus::{
    BundleValidator, Clock, ConsensusConfig, ConsensusError, EventBus,
    LatestSolidMilestoneTracker, LedgerService, LocalSnapshotManager, MilestoneService,
    MilestoneSolidifier, MilestoneTracker, NomineeTracker, RequestQueue, SeenRoundsRetriever,
    SnapshotError, SnapshotProvider, SnapshotService, SolidityPropagator, SystemClock,
    TransactionValidator, ValidatorSchedule, Worker,
};
use tangle_metrics::MetricsRecorder;
use tangle_storage::{KvStore, Tangle};
use tracing::info;

/// Fatal node startup errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

/// Collaborators the consensus core does not own.
pub struct NodeServices {
    pub store: Arc<dyn KvStore>,
    pub requests: Arc<dyn RequestQueue>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub clock: Arc<dyn Clock>,
}

impl NodeServices {
    /// Wall clock time and no-op metrics over `store`.
    pub fn new(store: Arc<dyn KvStore>, requests: Arc<dyn RequestQueue>) -> Self {
        Self {
            store,
            requests,
            metrics: tangle_metrics::noop(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Every consensus component of one node.
pub struct NodeContext {
    pub config: ConsensusConfig,
    pub tangle: Arc<Tangle>,
    pub events: Arc<EventBus>,
    pub provider: Arc<SnapshotProvider>,
    pub transactions: Arc<TransactionValidator>,
    pub bundles: Arc<BundleValidator>,
    pub snapshots: Arc<SnapshotService>,
    pub milestones: Arc<MilestoneService>,
    pub schedule: Arc<ValidatorSchedule>,
    pub solidifier: Arc<MilestoneSolidifier>,
    pub tracker: Arc<MilestoneTracker>,
    pub nominees: Arc<NomineeTracker>,
    pub ledger: Arc<LedgerService>,
    pub latest_solid: Arc<LatestSolidMilestoneTracker>,
    pub propagator: Arc<SolidityPropagator>,
    pub seen_rounds: Arc<SeenRoundsRetriever>,
    pub local_snapshots: Option<Arc<LocalSnapshotManager>>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("initial_index", &self.provider.initial_index())
            .field("latest_index", &self.provider.latest_index())
            .field("local_snapshots", &self.local_snapshots.is_some())
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    /// Validate `config`, load the initial snapshot, build every component
    /// and restore the ledger to the rounds applied before the last
    /// shutdown.
    pub fn build(config: ConsensusConfig, services: NodeServices) -> Result<Self, NodeError> {
        config.validate()?;
        let NodeServices {
            store,
            requests,
            metrics,
            clock,
        } = services;

        let tangle = Arc::new(Tangle::with_metrics(store, metrics.clone()));
        let events = Arc::new(EventBus::new());
        let provider = Arc::new(SnapshotProvider::load(&config)?);
        info!(
            index = provider.initial_index(),
            hash = %provider.initial().hash(),
            "Initial snapshot loaded"
        );

        let transactions = Arc::new(
            TransactionValidator::new(
                &config,
                tangle.clone(),
                provider.clone(),
                requests.clone(),
                clock.clone(),
            )
            .with_events(events.clone())
            .with_metrics(metrics.clone()),
        );
        let bundles = Arc::new(BundleValidator::new(tangle.clone(), metrics.clone()));
        let snapshots = Arc::new(
            SnapshotService::new(&config, tangle.clone(), provider.clone())
                .with_metrics(metrics.clone()),
        );
        let milestones = Arc::new(MilestoneService::new(
            &config,
            tangle.clone(),
            provider.clone(),
            snapshots.clone(),
            bundles.clone(),
        ));
        let schedule = Arc::new(ValidatorSchedule::new(config.initial_validators.iter().copied()));
        let solidifier = Arc::new(
            MilestoneSolidifier::new(&config, transactions.clone()).with_metrics(metrics.clone()),
        );
        let tracker = Arc::new(
            MilestoneTracker::new(
                &config,
                transactions.clone(),
                milestones.clone(),
                solidifier.clone(),
                schedule.clone(),
                clock.clone(),
            )
            .with_events(events.clone())
            .with_metrics(metrics.clone()),
        );
        let nominees = Arc::new(
            NomineeTracker::new(&config, tangle.clone(), bundles.clone(), schedule.clone())
                .with_events(events.clone())
                .with_metrics(metrics.clone()),
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
                clock,
            )
            .with_events(events.clone())
            .with_metrics(metrics.clone()),
        );
        let propagator = Arc::new(SolidityPropagator::new(
            transactions.clone(),
            metrics,
            config.propagation_interval(),
            config.propagation_scan_limit,
        ));
        let seen_rounds = Arc::new(SeenRoundsRetriever::new(
            &config,
            tangle.clone(),
            provider.clone(),
            requests,
        ));
        let local_snapshots = config.local_snapshots_enabled.then(|| {
            Arc::new(LocalSnapshotManager::new(
                &config,
                snapshots.clone(),
                tracker.clone(),
            ))
        });

        ledger.restore_ledger_state()?;
        info!(round = provider.latest_index(), "Ledger state restored");

        Ok(Self {
            config,
            tangle,
            events,
            provider,
            transactions,
            bundles,
            snapshots,
            milestones,
            schedule,
            solidifier,
            tracker,
            nominees,
            ledger,
            latest_solid,
            propagator,
            seen_rounds,
            local_snapshots,
        })
    }

    /// The background workers, one thread each.
    ///
    /// The nominee tracker only runs when a curator address is configured.
    pub fn workers(&self) -> Vec<Arc<dyn Worker>> {
        let mut workers: Vec<Arc<dyn Worker>> = vec![
            self.tracker.clone(),
            self.solidifier.clone(),
            self.propagator.clone(),
            self.latest_solid.clone(),
            self.seen_rounds.clone(),
        ];
        if !self.config.curator_address.is_null() {
            workers.push(self.nominees.clone());
        }
        if let Some(local) = &self.local_snapshots {
            workers.push(local.clone());
        }
        workers
    }
}
