//! Metrics facade for the Tangle node.
//!
//! Provides a [`MetricsRecorder`] trait with domain-specific methods and
//! default no-op implementations. Components receive an
//! `Arc<dyn MetricsRecorder>` when they are constructed, there is no
//! process-wide recorder.
//!
//! # Usage
//!
//! ```ignore
//! let metrics: Arc<dyn MetricsRecorder> = Arc::new(NoopRecorder);
//! let validator = BundleValidator::new(tangle.clone(), metrics.clone());
//! ```

use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════
// Trait
// ═══════════════════════════════════════════════════════════════════════

/// Domain-specific metrics recording trait.
///
/// All methods have default no-op implementations so backends only need
/// to override the metrics they care about.
#[allow(unused_variables)]
pub trait MetricsRecorder: Send + Sync + 'static {
    // ── Storage ──────────────────────────────────────────────────────

    /// Record a storage read latency.
    fn record_storage_read(&self, latency_secs: f64) {}

    /// Record a storage write latency.
    fn record_storage_write(&self, latency_secs: f64) {}

    /// Record the size of an atomic write batch.
    fn record_storage_batch_size(&self, size: usize) {}

    // ── Validation ───────────────────────────────────────────────────

    /// Record a bundle validation outcome.
    fn record_bundle_validated(&self, valid: bool) {}

    /// Record a bundle validation answered from the cached tail validity.
    fn record_bundle_validity_cache_hit(&self) {}

    /// Record a transaction rejected by the structural checks.
    fn record_transaction_rejected(&self, reason: &str) {}

    /// Record a transaction becoming solid.
    fn record_transaction_solidified(&self) {}

    /// Record the number of transactions solidified in one propagation tick.
    fn record_solidity_propagation(&self, solidified: usize, latency_secs: f64) {}

    // ── Milestones ───────────────────────────────────────────────────

    /// Record a milestone candidate outcome (`valid`, `invalid`, `incomplete`).
    fn record_milestone_candidate(&self, outcome: &str) {}

    /// Record a nominee set change taking effect at `start_round`.
    fn record_nominees_updated(&self, start_round: u64, count: usize) {}

    /// Set the current round index.
    fn set_current_round(&self, round: u64) {}

    /// Set the number of unsolid milestone candidates held by the solidifier.
    fn set_unsolid_milestones(&self, count: usize) {}

    // ── Ledger ───────────────────────────────────────────────────────

    /// Record a round applied to the ledger.
    fn record_round_applied(&self, round: u64, latency_secs: f64) {}

    /// Record a failed ledger application.
    fn record_ledger_application_failure(&self, round: u64) {}

    /// Record a repair attempt with the current backoff counter.
    fn record_ledger_repair(&self, error_round: u64, backoff_counter: u64) {}

    /// Set the latest solid round index.
    fn set_latest_solid_round(&self, round: u64) {}

    // ── Snapshots ────────────────────────────────────────────────────

    /// Record a replay over `rounds` rounds.
    fn record_snapshot_replay(&self, rounds: u64) {}

    /// Record a rollback over `rounds` rounds.
    fn record_snapshot_rollback(&self, rounds: u64) {}

    /// Record a local snapshot persisted at `index`.
    fn record_local_snapshot(&self, index: u64, solid_entry_points: usize, latency_secs: f64) {}
}

/// A metrics recorder that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}

/// Convenience constructor for the no-op recorder.
pub fn noop() -> Arc<dyn MetricsRecorder> {
    Arc::new(NoopRecorder)
}
