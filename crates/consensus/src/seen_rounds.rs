//! Requests the milestones a local snapshot recorded as seen after it, so a
//! node started from that snapshot finds the following rounds quickly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tangle_storage::{StorageError, Tangle};
use tangle_types::Hash;
use tracing::{debug, error};

use crate::collaborators::RequestQueue;
use crate::config::ConsensusConfig;
use crate::snapshot::SnapshotProvider;
use crate::worker::{StopFlag, Worker};

pub struct SeenRoundsRetriever {
    tangle: Arc<Tangle>,
    provider: Arc<SnapshotProvider>,
    requests: Arc<dyn RequestQueue>,
    pending: Mutex<BTreeMap<u64, Vec<Hash>>>,
    range: u64,
    interval: Duration,
}

impl std::fmt::Debug for SeenRoundsRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenRoundsRetriever")
            .field("pending", &self.pending.lock().len())
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

impl SeenRoundsRetriever {
    pub fn new(
        config: &ConsensusConfig,
        tangle: Arc<Tangle>,
        provider: Arc<SnapshotProvider>,
        requests: Arc<dyn RequestQueue>,
    ) -> Self {
        let pending = provider
            .initial()
            .metadata
            .seen_rounds
            .iter()
            .map(|(index, hashes)| (*index, hashes.clone()))
            .collect();
        Self {
            tangle,
            provider,
            requests,
            pending: Mutex::new(pending),
            range: config.seen_round_retrieve_range,
            interval: config.tracker_interval(),
        }
    }

    /// Rounds whose milestones were not requested yet.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Request the milestones of every pending round up to `range` rounds
    /// past the latest snapshot. Returns the number of requests issued.
    pub fn retrieve(&self) -> Result<usize, StorageError> {
        let initial_index = self.provider.initial_index();
        let limit = self.provider.latest_index().saturating_add(self.range);
        let due: Vec<(u64, Vec<Hash>)> = {
            let mut pending = self.pending.lock();
            pending.retain(|index, _| *index > initial_index);
            let later = pending.split_off(&limit.saturating_add(1));
            let due = std::mem::replace(&mut *pending, later);
            due.into_iter().collect()
        };

        let mut requested = 0;
        for (index, hashes) in due {
            for hash in hashes {
                if self.tangle.exists(&hash)? || self.requests.is_transaction_requested(&hash, true) {
                    continue;
                }
                self.requests.enqueue_transaction(&hash, true);
                requested += 1;
            }
            debug!(round = index, "requested seen milestones");
        }
        Ok(requested)
    }
}

impl Worker for SeenRoundsRetriever {
    fn name(&self) -> &'static str {
        "seen-rounds-retriever"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&self, _stop: &StopFlag) {
        if self.pending() == 0 {
            return;
        }
        if let Err(e) = self.retrieve() {
            error!(error = %e, "seen round retrieval failed");
        }
    }
}
