//! Validator set rotation.
//!
//! The curator publishes nominee bundles shaped like milestones: signature
//! fragments, a Merkle path tagged with the start round, and the nominated
//! validator addresses in the tip slots. The [`NomineeTracker`] picks them
//! up and records them in the shared [`ValidatorSchedule`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tangle_metrics::MetricsRecorder;
use tangle_storage::Tangle;
use tangle_types::{merkle, Hash, SpongeMode};
use tracing::{debug, error, info};

use crate::bundle_validator::BundleValidator;
use crate::config::ConsensusConfig;
use crate::error::{BundleError, ConsensusError};
use crate::events::{ConsensusEvent, EventBus};
use crate::milestone::layout;
use crate::worker::{StopFlag, Worker};

/// Validator sets keyed by the round they take effect at.
#[derive(Debug)]
pub struct ValidatorSchedule {
    sets: RwLock<BTreeMap<u64, Arc<HashSet<Hash>>>>,
}

impl ValidatorSchedule {
    /// A schedule whose set for round 0 onward is `initial`.
    pub fn new(initial: impl IntoIterator<Item = Hash>) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(0, Arc::new(initial.into_iter().collect()));
        Self {
            sets: RwLock::new(sets),
        }
    }

    pub fn validators_for_round(&self, round: u64) -> Arc<HashSet<Hash>> {
        self.sets
            .read()
            .range(..=round)
            .next_back()
            .map(|(_, set)| Arc::clone(set))
            .unwrap_or_default()
    }

    /// Start round of the newest scheduled set.
    pub fn latest_start_round(&self) -> u64 {
        self.sets.read().keys().next_back().copied().unwrap_or(0)
    }

    /// Schedule `validators` from `start_round` on. Only sets starting after
    /// the newest scheduled one are accepted.
    pub fn schedule(&self, start_round: u64, validators: HashSet<Hash>) -> bool {
        let mut sets = self.sets.write();
        if sets.keys().next_back().is_some_and(|&latest| start_round <= latest) {
            return false;
        }
        sets.insert(start_round, Arc::new(validators));
        true
    }
}

/// Scans the curator address and updates the [`ValidatorSchedule`].
pub struct NomineeTracker {
    tangle: Arc<Tangle>,
    bundles: Arc<BundleValidator>,
    schedule: Arc<ValidatorSchedule>,
    events: Arc<EventBus>,
    metrics: Arc<dyn MetricsRecorder>,
    seen: Mutex<HashSet<Hash>>,
    curator: Hash,
    security: usize,
    key_depth: usize,
    validates_signatures: bool,
    interval: Duration,
}

impl std::fmt::Debug for NomineeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NomineeTracker")
            .field("curator", &self.curator)
            .field("latest_start_round", &self.schedule.latest_start_round())
            .finish_non_exhaustive()
    }
}

impl NomineeTracker {
    pub fn new(
        config: &ConsensusConfig,
        tangle: Arc<Tangle>,
        bundles: Arc<BundleValidator>,
        schedule: Arc<ValidatorSchedule>,
    ) -> Self {
        Self {
            tangle,
            bundles,
            schedule,
            events: Arc::new(EventBus::new()),
            metrics: tangle_metrics::noop(),
            seen: Mutex::new(HashSet::new()),
            curator: config.curator_address,
            security: config.curator_security,
            key_depth: config.curator_key_depth,
            validates_signatures: config.validates_milestone_signatures(),
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

    pub fn schedule(&self) -> &Arc<ValidatorSchedule> {
        &self.schedule
    }

    /// Check the curator's unseen transactions. Returns the number of
    /// validator sets scheduled.
    pub fn scan(&self, stop: &StopFlag) -> Result<usize, ConsensusError> {
        let mut scheduled = 0;
        for hash in self.tangle.address_transactions(&self.curator)? {
            if stop.is_stopped() {
                break;
            }
            if self.seen.lock().contains(&hash) {
                continue;
            }
            let Some(tx) = self.tangle.transaction(&hash)? else {
                continue;
            };
            if !tx.is_tail() {
                self.seen.lock().insert(hash);
                continue;
            }
            match self.nominees(&hash)? {
                Nominees::Incomplete => continue,
                Nominees::Invalid => {}
                Nominees::Valid { start_round, validators } => {
                    let count = validators.len();
                    if self.schedule.schedule(start_round, validators) {
                        info!(start_round, count, "Scheduled new validator set");
                        self.metrics.record_nominees_updated(start_round, count);
                        self.events
                            .publish(ConsensusEvent::NomineesUpdated { start_round, count });
                        scheduled += 1;
                    }
                }
            }
            self.seen.lock().insert(hash);
        }
        Ok(scheduled)
    }

    fn nominees(&self, tail: &Hash) -> Result<Nominees, ConsensusError> {
        let bundle = match self.bundles.validate_bundle(tail) {
            Ok(bundle) => bundle,
            Err(BundleError::Storage(e)) => return Err(e.into()),
            Err(e) if e.is_incomplete() => return Ok(Nominees::Incomplete),
            Err(e) => {
                debug!(hash = %tail, error = %e, "nominee bundle invalid");
                return Ok(Nominees::Invalid);
            }
        };
        let Some(merkle_tx) = bundle.get(self.security) else {
            return Ok(Nominees::Invalid);
        };
        let start_round = merkle_tx.round_index();
        if bundle.iter().any(|tx| tx.round_index() != start_round) {
            debug!(hash = %tail, start_round, "nominee bundle tags disagree");
            return Ok(Nominees::Invalid);
        }
        let signed = !self.validates_signatures
            || merkle::validate_merkle_signature(
                &bundle,
                SpongeMode::S256,
                &self.curator,
                start_round,
                self.security,
                self.key_depth,
            );
        if !signed {
            debug!(hash = %tail, "nominee signature rejected");
            return Ok(Nominees::Invalid);
        }
        Ok(Nominees::Valid {
            start_round,
            validators: layout::tip_set(&bundle, self.security).into_iter().collect(),
        })
    }
}

enum Nominees {
    Valid {
        start_round: u64,
        validators: HashSet<Hash>,
    },
    Invalid,
    Incomplete,
}

impl Worker for NomineeTracker {
    fn name(&self) -> &'static str {
        "nominee-tracker"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&self, stop: &StopFlag) {
        if let Err(e) = self.scan(stop) {
            error!(error = %e, "nominee scan failed");
        }
    }
}
