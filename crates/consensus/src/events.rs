//! Consensus notifications for the rest of the node.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tangle_types::Hash;

/// Something the consensus core wants observers to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A transaction's whole history is now present.
    TransactionSolidified(Hash),
    /// The round clock moved to a new round.
    RoundChanged(u64),
    /// A valid milestone was added to a round.
    MilestoneAccepted { round: u64, hash: Hash },
    /// The ledger advanced to (or was rolled back to) a new solid round.
    LatestSolidRoundChanged(u64),
    /// A nominee set takes effect at `start_round`.
    NomineesUpdated { start_round: u64, count: usize },
}

/// Fan-out of [`ConsensusEvent`]s to any number of subscribers.
///
/// Subscribers whose receiver was dropped are forgotten on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ConsensusEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ConsensusEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ConsensusEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
