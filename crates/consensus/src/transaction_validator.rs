//! Per-transaction checks and solidity.
//!
//! A transaction is solid once both of its parents are solid or solid entry
//! points. Members of a validated milestone bundle replace trunk and branch
//! with the parents their layout expands to. Solidity is monotonic.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tangle_metrics::MetricsRecorder;
use tangle_storage::{StorageError, Tangle};
use tangle_types::transaction::VALUE_USABLE_SIZE;
use tangle_types::{Hash, Transaction, TransactionMetadata};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::collaborators::RequestQueue;
use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, ValidationError};
use crate::events::{ConsensusEvent, EventBus};
use crate::milestone::layout;
use crate::snapshot::SnapshotProvider;
use crate::solidity::SolidQueue;

/// How far ahead of the local clock a transaction may be stamped.
pub const MAX_TIMESTAMP_FUTURE_SECS: u64 = 2 * 60 * 60;

/// Structural validation and solidity checks for single transactions.
pub struct TransactionValidator {
    tangle: Arc<Tangle>,
    snapshots: Arc<SnapshotProvider>,
    requests: Arc<dyn RequestQueue>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    metrics: Arc<dyn MetricsRecorder>,
    solid_queue: Arc<SolidQueue>,
    min_weight_magnitude: u32,
    validator_security: usize,
}

impl std::fmt::Debug for TransactionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionValidator")
            .field("min_weight_magnitude", &self.min_weight_magnitude)
            .finish_non_exhaustive()
    }
}

impl TransactionValidator {
    pub fn new(
        config: &ConsensusConfig,
        tangle: Arc<Tangle>,
        snapshots: Arc<SnapshotProvider>,
        requests: Arc<dyn RequestQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tangle,
            snapshots,
            requests,
            clock,
            events: Arc::new(EventBus::new()),
            metrics: tangle_metrics::noop(),
            solid_queue: Arc::new(SolidQueue::new()),
            min_weight_magnitude: config.effective_min_weight_magnitude(),
            validator_security: config.validator_security,
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

    pub fn min_weight_magnitude(&self) -> u32 {
        self.min_weight_magnitude
    }

    /// Newly solid hashes waiting for the propagator.
    pub fn solid_queue(&self) -> &Arc<SolidQueue> {
        &self.solid_queue
    }

    pub fn tangle(&self) -> &Arc<Tangle> {
        &self.tangle
    }

    pub fn snapshots(&self) -> &Arc<SnapshotProvider> {
        &self.snapshots
    }

    // ── Structural checks ────────────────────────────────────────────

    /// Whether the timestamp lies before the initial snapshot or too far in
    /// the future.
    ///
    /// Transactions requested while solidifying a milestone are exempt, and
    /// solid entry points may carry any timestamp below the snapshot.
    pub fn has_invalid_timestamp(&self, tx: &Transaction) -> bool {
        let hash = tx.hash();
        if self.requests.is_transaction_requested(&hash, true) {
            return false;
        }
        let initial = self.snapshots.initial();
        let now_millis = self.clock.now_millis();
        if tx.attachment_timestamp() == 0 {
            let stale = tx.timestamp() < initial.timestamp() && !initial.has_solid_entry_point(&hash);
            return stale || tx.timestamp() > now_millis / 1000 + MAX_TIMESTAMP_FUTURE_SECS;
        }
        tx.attachment_timestamp() < initial.timestamp().saturating_mul(1000)
            || tx.attachment_timestamp() > now_millis + MAX_TIMESTAMP_FUTURE_SECS * 1000
    }

    /// Reject stale timestamps, overflowing value fields and insufficient
    /// proof of work.
    pub fn run_validation(
        &self,
        tx: &Transaction,
        min_weight_magnitude: u32,
    ) -> Result<(), ValidationError> {
        let hash = tx.hash();
        if self.has_invalid_timestamp(tx) {
            debug!(
                hash = %hash,
                address = %tx.address(),
                timestamp = tx.timestamp(),
                attachment_timestamp = tx.attachment_timestamp(),
                "invalid timestamp"
            );
            self.metrics.record_transaction_rejected("timestamp");
            return Err(ValidationError::StaleTimestamp(hash));
        }
        if tx.reserved_value_bytes().iter().any(|b| *b != 0) {
            self.metrics.record_transaction_rejected("value");
            return Err(ValidationError::InvalidState {
                hash,
                reason: format!("value uses bytes beyond the first {VALUE_USABLE_SIZE}"),
            });
        }
        if tx.weight_magnitude() < min_weight_magnitude {
            self.metrics.record_transaction_rejected("weight");
            return Err(ValidationError::InvalidState {
                hash,
                reason: format!(
                    "weight magnitude {} below {min_weight_magnitude}",
                    tx.weight_magnitude()
                ),
            });
        }
        Ok(())
    }

    /// Decode raw bytes and validate the result with the configured weight.
    pub fn validate_bytes(&self, bytes: &[u8]) -> Result<Transaction, ConsensusError> {
        let tx = Transaction::from_bytes(bytes).map_err(|e| ValidationError::InvalidState {
            hash: Hash::NULL,
            reason: e.to_string(),
        })?;
        self.run_validation(&tx, self.min_weight_magnitude)?;
        Ok(tx)
    }

    /// Whether `hash` meets the configured weight magnitude.
    pub fn has_sufficient_weight(&self, hash: &Hash) -> bool {
        hash.leading_zero_bits() >= self.min_weight_magnitude
    }

    // ── Solidity ─────────────────────────────────────────────────────

    pub fn is_solid(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.tangle.metadata(hash)?.is_some_and(|m| m.solid))
    }

    /// Solid already, or made solid by a one-hop check of its parents.
    pub fn check_solidity(&self, hash: &Hash) -> Result<bool, StorageError> {
        if self.is_solid(hash)? {
            return Ok(true);
        }
        self.quick_set_solid(hash)
    }

    /// Mark `hash` solid if all of its immediate parents are.
    ///
    /// Missing parents are requested. Returns whether this call made the
    /// transaction solid.
    pub fn quick_set_solid(&self, hash: &Hash) -> Result<bool, StorageError> {
        let solidified = self.set_solid_if_parents_solid(hash)?;
        if solidified {
            self.solid_queue.push(*hash);
        }
        Ok(solidified)
    }

    /// [`quick_set_solid`](Self::quick_set_solid) without handing the
    /// result to the propagator.
    pub(crate) fn set_solid_if_parents_solid(&self, hash: &Hash) -> Result<bool, StorageError> {
        let Some((tx, metadata)) = self.tangle.load(hash)? else {
            return Ok(false);
        };
        if metadata.solid {
            return Ok(false);
        }
        let Some(parents) = self.parents(&tx, &metadata)? else {
            trace!(hash = %hash, "milestone parents not resolvable yet");
            return Ok(false);
        };
        let mut solid = true;
        for parent in &parents {
            if !self.check_approvee(parent, true)? {
                solid = false;
            }
        }
        if !solid {
            return Ok(false);
        }
        self.mark_solid(hash)?;
        Ok(true)
    }

    /// Bounded walk of the unsolid history of `hash`.
    ///
    /// Every missing transaction found is requested with the `milestone`
    /// priority. If the whole history is present within `limit` visited
    /// transactions, all of them are marked solid.
    pub fn check_solidity_deep(
        &self,
        hash: &Hash,
        milestone: bool,
        limit: usize,
    ) -> Result<bool, StorageError> {
        if self.snapshots.is_solid_entry_point(hash) || self.is_solid(hash)? {
            return Ok(true);
        }
        let mut solid = true;
        let mut visited = HashSet::new();
        let mut unsolid = Vec::new();
        let mut queue = VecDeque::from([*hash]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) || self.snapshots.is_solid_entry_point(&current) {
                continue;
            }
            let Some((tx, metadata)) = self.tangle.load(&current)? else {
                if !self.requests.is_transaction_requested(&current, milestone) {
                    self.requests.enqueue_transaction(&current, milestone);
                }
                solid = false;
                continue;
            };
            if metadata.solid {
                continue;
            }
            if unsolid.len() >= limit {
                debug!(hash = %hash, limit, "solidity walk limit reached");
                return Ok(false);
            }
            unsolid.push(current);
            match self.parents(&tx, &metadata)? {
                Some(parents) => queue.extend(parents),
                None => solid = false,
            }
        }
        if solid {
            for hash in unsolid.iter().rev() {
                self.mark_solid(hash)?;
                self.solid_queue.push(*hash);
            }
        }
        Ok(solid)
    }

    /// A parent counts as solid if it is a solid entry point or stored and
    /// solid. Missing parents with enough weight are requested when
    /// `request` is set.
    fn check_approvee(&self, hash: &Hash, request: bool) -> Result<bool, StorageError> {
        if self.snapshots.is_solid_entry_point(hash) {
            return Ok(true);
        }
        match self.tangle.metadata(hash)? {
            Some(metadata) => Ok(metadata.solid),
            None => {
                if request && self.has_sufficient_weight(hash) {
                    trace!(hash = %hash, "requesting missing parent");
                    self.requests.enqueue_transaction(hash, false);
                }
                Ok(false)
            }
        }
    }

    /// Parents relevant for solidity, `None` while a milestone member's
    /// Merkle roots cannot be expanded.
    fn parents(
        &self,
        tx: &Transaction,
        metadata: &TransactionMetadata,
    ) -> Result<Option<Vec<Hash>>, StorageError> {
        if metadata.milestone {
            let initial_index = self.snapshots.initial_index();
            return layout::member_parents(&self.tangle, tx, self.validator_security, initial_index);
        }
        Ok(Some(vec![tx.trunk(), tx.branch()]))
    }

    fn mark_solid(&self, hash: &Hash) -> Result<(), StorageError> {
        let mut changed = false;
        self.tangle.update_metadata(hash, |m| {
            changed = !m.solid;
            m.solid = true;
        })?;
        if changed {
            trace!(hash = %hash, "solidified");
            self.metrics.record_transaction_solidified();
            self.events.publish(ConsensusEvent::TransactionSolidified(*hash));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::snapshot::provider::builtin_snapshot;
    use parking_lot::Mutex;
    use tangle_storage_memory::MemoryStore;
    use tangle_types::TransactionBuilder;

    const NOW: u64 = 1_600_000_000_000;

    #[derive(Default)]
    struct Requests(Mutex<Vec<(Hash, bool)>>);

    impl RequestQueue for Requests {
        fn enqueue_transaction(&self, hash: &Hash, milestone: bool) {
            self.0.lock().push((*hash, milestone));
        }

        fn is_transaction_requested(&self, hash: &Hash, milestone: bool) -> bool {
            self.0.lock().contains(&(*hash, milestone))
        }
    }

    struct Fixture {
        tangle: Arc<Tangle>,
        requests: Arc<Requests>,
        validator: TransactionValidator,
    }

    fn fixture() -> Fixture {
        let config = ConsensusConfig {
            snapshot_timestamp: 1_500_000_000,
            ..ConsensusConfig::testnet()
        };
        let tangle = Arc::new(Tangle::new(Arc::new(MemoryStore::new())));
        let mut snapshot = builtin_snapshot(&config);
        snapshot.metadata.solid_entry_points.insert(Hash::NULL, 0);
        let snapshots = Arc::new(SnapshotProvider::new(snapshot));
        let requests = Arc::new(Requests::default());
        let validator = TransactionValidator::new(
            &config,
            tangle.clone(),
            snapshots,
            requests.clone(),
            Arc::new(ManualClock::new(NOW)),
        );
        Fixture {
            tangle,
            requests,
            validator,
        }
    }

    fn tx(nonce: u64, trunk: Hash, branch: Hash) -> Transaction {
        TransactionBuilder::new()
            .nonce(nonce)
            .timestamp(NOW / 1000)
            .trunk(&trunk)
            .branch(&branch)
            .build()
    }

    #[test]
    fn test_timestamp_bounds() {
        let f = fixture();
        assert!(f.validator.run_validation(&tx(1, Hash::NULL, Hash::NULL), 0).is_ok());

        let stale = TransactionBuilder::new().timestamp(1_400_000_000).build();
        assert_eq!(
            f.validator.run_validation(&stale, 0),
            Err(ValidationError::StaleTimestamp(stale.hash()))
        );

        let future = TransactionBuilder::new()
            .attachment_timestamp(NOW + (MAX_TIMESTAMP_FUTURE_SECS + 1) * 1000)
            .build();
        assert!(f.validator.has_invalid_timestamp(&future));

        // Milestone-related requests are exempt.
        f.requests.enqueue_transaction(&stale.hash(), true);
        assert!(!f.validator.has_invalid_timestamp(&stale));
    }

    #[test]
    fn test_insufficient_weight_rejected() {
        let f = fixture();
        let tx = tx(1, Hash::NULL, Hash::NULL);
        let too_heavy = tx.weight_magnitude() + 1;
        assert!(matches!(
            f.validator.run_validation(&tx, too_heavy),
            Err(ValidationError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_validate_bytes_rejects_wrong_length() {
        let f = fixture();
        assert!(matches!(
            f.validator.validate_bytes(&[0u8; 10]),
            Err(ConsensusError::Validation(ValidationError::InvalidState { .. }))
        ));
    }

    #[test]
    fn test_quick_set_solid_on_entry_points() {
        let f = fixture();
        let a = tx(1, Hash::NULL, Hash::NULL);
        f.tangle.store_transaction(&a, NOW).unwrap();

        assert!(f.validator.check_solidity(&a.hash()).unwrap());
        assert!(f.validator.is_solid(&a.hash()).unwrap());
        assert_eq!(f.validator.solid_queue().len(), 1);
        // Already solid: nothing new.
        assert!(!f.validator.quick_set_solid(&a.hash()).unwrap());
    }

    #[test]
    fn test_missing_parent_is_requested() {
        let f = fixture();
        let parent = tx(1, Hash::NULL, Hash::NULL);
        let child = tx(2, parent.hash(), Hash::NULL);
        f.tangle.store_transaction(&child, NOW).unwrap();

        assert!(!f.validator.check_solidity(&child.hash()).unwrap());
        assert!(f.requests.is_transaction_requested(&parent.hash(), false));
        assert!(!f.validator.is_solid(&child.hash()).unwrap());
    }

    #[test]
    fn test_deep_check_marks_whole_history() {
        let f = fixture();
        let a = tx(1, Hash::NULL, Hash::NULL);
        let b = tx(2, a.hash(), Hash::NULL);
        let c = tx(3, b.hash(), a.hash());
        for t in [&a, &b, &c] {
            f.tangle.store_transaction(t, NOW).unwrap();
        }

        assert!(!f.validator.check_solidity_deep(&c.hash(), true, 1).unwrap());
        assert!(!f.validator.is_solid(&a.hash()).unwrap());

        assert!(f.validator.check_solidity_deep(&c.hash(), true, 10).unwrap());
        for t in [&a, &b, &c] {
            assert!(f.validator.is_solid(&t.hash()).unwrap());
        }
    }

    #[test]
    fn test_deep_check_requests_with_milestone_priority() {
        let f = fixture();
        let missing = tx(1, Hash::NULL, Hash::NULL);
        let top = tx(2, missing.hash(), Hash::NULL);
        f.tangle.store_transaction(&top, NOW).unwrap();

        assert!(!f.validator.check_solidity_deep(&top.hash(), true, 10).unwrap());
        assert!(f.requests.is_transaction_requested(&missing.hash(), true));
        assert!(!f.validator.is_solid(&top.hash()).unwrap());
    }
}
