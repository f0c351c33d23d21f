//! Contracts the consensus core requires from the rest of the node.

use tangle_types::Hash;

use crate::error::ConsensusError;

/// Requests missing transactions from neighbors.
///
/// `milestone` marks requests needed to solidify a milestone, which the
/// networking layer serves first.
pub trait RequestQueue: Send + Sync {
    fn enqueue_transaction(&self, hash: &Hash, milestone: bool);

    fn is_transaction_requested(&self, hash: &Hash, milestone: bool) -> bool;
}

/// A request queue that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRequestQueue;

impl RequestQueue for NoopRequestQueue {
    fn enqueue_transaction(&self, _hash: &Hash, _milestone: bool) {}

    fn is_transaction_requested(&self, _hash: &Hash, _milestone: bool) -> bool {
        false
    }
}

/// Picks the trunk and branch a new transaction approves.
pub trait TipSelector: Send + Sync {
    fn select_tips(&self) -> Result<(Hash, Hash), ConsensusError>;
}
