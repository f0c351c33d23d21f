//! Upward solidity propagation.
//!
//! Producers push newly solid hashes into a [`SolidQueue`]. Once per tick the
//! [`SolidityPropagator`] swaps the queue's set with its own empty working
//! set under the queue lock, then walks approvers of the detached set
//! without holding it.

use std::collections::{HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tangle_metrics::MetricsRecorder;
use tangle_storage::StorageError;
use tangle_types::Hash;
use tracing::{debug, error};

use crate::transaction_validator::TransactionValidator;
use crate::worker::{StopFlag, Worker};

/// Hashes that became solid and whose approvers were not visited yet.
#[derive(Debug, Default)]
pub struct SolidQueue {
    pending: Mutex<HashSet<Hash>>,
}

impl SolidQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, hash: Hash) {
        self.pending.lock().insert(hash);
    }

    pub fn extend(&self, hashes: impl IntoIterator<Item = Hash>) {
        self.pending.lock().extend(hashes);
    }

    /// Exchange the pending set with `other`.
    pub fn swap(&self, other: &mut HashSet<Hash>) {
        mem::swap(&mut *self.pending.lock(), other);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Cascades solidity from solid transactions to their approvers.
pub struct SolidityPropagator {
    validator: Arc<TransactionValidator>,
    metrics: Arc<dyn MetricsRecorder>,
    working: Mutex<HashSet<Hash>>,
    interval: Duration,
    scan_limit: usize,
}

impl std::fmt::Debug for SolidityPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolidityPropagator")
            .field("interval", &self.interval)
            .field("scan_limit", &self.scan_limit)
            .finish_non_exhaustive()
    }
}

impl SolidityPropagator {
    pub fn new(
        validator: Arc<TransactionValidator>,
        metrics: Arc<dyn MetricsRecorder>,
        interval: Duration,
        scan_limit: usize,
    ) -> Self {
        Self {
            validator,
            metrics,
            working: Mutex::new(HashSet::new()),
            interval,
            scan_limit: scan_limit.max(1),
        }
    }

    /// One propagation pass. Returns the number of transactions solidified.
    ///
    /// Hashes left over when the scan limit is hit, or when `stop` is
    /// raised, go back into the queue for the next pass.
    pub fn propagate(&self, stop: &StopFlag) -> Result<usize, StorageError> {
        let start = Instant::now();
        let queue = self.validator.solid_queue();
        let mut working = self.working.lock();
        queue.swap(&mut working);
        working.extend(
            self.validator
                .snapshots()
                .latest()
                .metadata
                .solid_entry_points
                .keys()
                .copied(),
        );

        let tangle = self.validator.tangle();
        let min_weight = self.validator.min_weight_magnitude();
        let mut frontier: VecDeque<Hash> = working.drain().collect();
        let mut visited = HashSet::new();
        let mut solidified = 0;
        while let Some(hash) = frontier.pop_front() {
            if stop.is_stopped() || visited.len() >= self.scan_limit {
                frontier.push_front(hash);
                queue.extend(frontier);
                break;
            }
            if !visited.insert(hash) {
                continue;
            }
            for approver in tangle.approvers(&hash)? {
                if approver.leading_zero_bits() < min_weight {
                    continue;
                }
                if self.validator.set_solid_if_parents_solid(&approver)? {
                    solidified += 1;
                    frontier.push_back(approver);
                }
            }
        }

        self.metrics
            .record_solidity_propagation(solidified, start.elapsed().as_secs_f64());
        if solidified > 0 {
            debug!(solidified, "propagated solidity");
        }
        Ok(solidified)
    }
}

impl Worker for SolidityPropagator {
    fn name(&self) -> &'static str {
        "solidity-propagator"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&self, stop: &StopFlag) {
        if let Err(e) = self.propagate(stop) {
            error!(error = %e, "solidity propagation failed");
        }
    }
}
