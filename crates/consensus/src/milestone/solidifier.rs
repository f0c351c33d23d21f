//! Requests the missing history of accepted but unsolid milestones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tangle_metrics::MetricsRecorder;
use tangle_types::Hash;
use tracing::{debug, error};

use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::transaction_validator::TransactionValidator;
use crate::worker::{StopFlag, Worker};

pub struct MilestoneSolidifier {
    validator: Arc<TransactionValidator>,
    metrics: Arc<dyn MetricsRecorder>,
    unsolid: Mutex<HashMap<Hash, u64>>,
    queue_size: usize,
    transaction_limit: usize,
    interval: Duration,
}

impl std::fmt::Debug for MilestoneSolidifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MilestoneSolidifier")
            .field("unsolid", &self.unsolid.lock().len())
            .field("queue_size", &self.queue_size)
            .finish_non_exhaustive()
    }
}

impl MilestoneSolidifier {
    pub fn new(config: &ConsensusConfig, validator: Arc<TransactionValidator>) -> Self {
        Self {
            validator,
            metrics: tangle_metrics::noop(),
            unsolid: Mutex::new(HashMap::new()),
            queue_size: config.solidifier_queue_size.max(1),
            transaction_limit: config.solidifier_transaction_limit,
            interval: config.solidifier_interval(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Track `hash`, a milestone for `round`, until it is solid.
    pub fn add(&self, hash: Hash, round: u64) {
        let mut unsolid = self.unsolid.lock();
        if unsolid.insert(hash, round).is_none() {
            debug!(hash = %hash, round, "tracking unsolid milestone");
        }
    }

    pub fn len(&self) -> usize {
        self.unsolid.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.unsolid.lock().is_empty()
    }

    /// Run a solidity check on the oldest candidates. Returns the number
    /// that became solid.
    pub fn solidify(&self, stop: &StopFlag) -> Result<usize, ConsensusError> {
        let initial_index = self.validator.snapshots().initial_index();
        let batch: Vec<(Hash, u64)> = {
            let mut unsolid = self.unsolid.lock();
            unsolid.retain(|_, round| *round > initial_index);
            let mut candidates: Vec<(Hash, u64)> =
                unsolid.iter().map(|(hash, round)| (*hash, *round)).collect();
            candidates.sort_by_key(|&(hash, round)| (round, hash));
            candidates.truncate(self.queue_size);
            candidates
        };

        let mut solidified = 0;
        for (hash, round) in batch {
            if stop.is_stopped() {
                break;
            }
            if self
                .validator
                .check_solidity_deep(&hash, true, self.transaction_limit)?
            {
                debug!(hash = %hash, round, "milestone solid");
                self.unsolid.lock().remove(&hash);
                solidified += 1;
            }
        }
        self.metrics.set_unsolid_milestones(self.len());
        Ok(solidified)
    }
}

impl Worker for MilestoneSolidifier {
    fn name(&self) -> &'static str {
        "milestone-solidifier"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&self, stop: &StopFlag) {
        if let Err(e) = self.solidify(stop) {
            error!(error = %e, "milestone solidification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::RequestQueue;
    use crate::snapshot::provider::builtin_snapshot;
    use crate::snapshot::SnapshotProvider;
    use std::collections::HashSet;
    use tangle_storage::Tangle;
    use tangle_storage_memory::MemoryStore;
    use tangle_types::TransactionBuilder;

    #[derive(Default)]
    struct Requests(Mutex<HashSet<(Hash, bool)>>);

    impl RequestQueue for Requests {
        fn enqueue_transaction(&self, hash: &Hash, milestone: bool) {
            self.0.lock().insert((*hash, milestone));
        }

        fn is_transaction_requested(&self, hash: &Hash, milestone: bool) -> bool {
            self.0.lock().contains(&(*hash, milestone))
        }
    }

    fn solidifier(start_index: u64) -> (MilestoneSolidifier, Arc<Requests>) {
        let config = ConsensusConfig {
            milestone_start_index: start_index,
            solidifier_queue_size: 1,
            ..ConsensusConfig::testnet()
        };
        let requests = Arc::new(Requests::default());
        let mut snapshot = builtin_snapshot(&config);
        snapshot.metadata.solid_entry_points.insert(Hash::NULL, start_index);
        let validator = Arc::new(TransactionValidator::new(
            &config,
            Arc::new(Tangle::new(Arc::new(MemoryStore::new()))),
            Arc::new(SnapshotProvider::new(snapshot)),
            requests.clone(),
            Arc::new(ManualClock::new(0)),
        ));
        (MilestoneSolidifier::new(&config, validator), requests)
    }

    #[test]
    fn test_requests_missing_history_then_drops_solid() {
        let (solidifier, requests) = solidifier(0);
        let parent = TransactionBuilder::new().nonce(1).build();
        let milestone = TransactionBuilder::new().nonce(2).trunk(&parent.hash()).build();
        let tangle = solidifier.validator.tangle().clone();
        tangle.store_transaction(&milestone, 0).unwrap();
        solidifier.add(milestone.hash(), 3);

        assert_eq!(solidifier.solidify(&StopFlag::new()).unwrap(), 0);
        assert!(requests.is_transaction_requested(&parent.hash(), true));
        assert_eq!(solidifier.len(), 1);

        tangle.store_transaction(&parent, 0).unwrap();
        assert_eq!(solidifier.solidify(&StopFlag::new()).unwrap(), 1);
        assert!(solidifier.is_empty());
    }

    #[test]
    fn test_oldest_round_first() {
        let (solidifier, requests) = solidifier(0);
        let old = Hash::new([1; 32]);
        let new = Hash::new([2; 32]);
        solidifier.add(new, 9);
        solidifier.add(old, 4);
        solidifier.solidify(&StopFlag::new()).unwrap();
        assert!(requests.is_transaction_requested(&old, true));
        assert!(!requests.is_transaction_requested(&new, true));
    }

    #[test]
    fn test_drops_rounds_below_initial_snapshot() {
        let (solidifier, _) = solidifier(10);
        solidifier.add(Hash::new([1; 32]), 10);
        solidifier.add(Hash::new([2; 32]), 11);
        solidifier.solidify(&StopFlag::new()).unwrap();
        assert_eq!(solidifier.len(), 1);
    }
}
