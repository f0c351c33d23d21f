//! Consensus configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tangle_types::{Hash, RoundClock};

use crate::error::ConsensusError;

/// Consensus configuration.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Start of round 0, in milliseconds since the epoch.
    pub genesis_time: u64,

    /// Length of a round in milliseconds.
    pub round_duration: u64,

    /// Tail of each round during which milestones are no longer accepted (ms).
    pub round_pause: u64,

    /// Depth of the validators' milestone Merkle key trees.
    pub milestone_key_depth: usize,

    /// Signature fragments per milestone bundle.
    pub validator_security: usize,

    /// Address of the curator that publishes nominee sets.
    pub curator_address: Hash,

    /// Signature fragments per nominee bundle.
    pub curator_security: usize,

    /// Depth of the curator's Merkle key tree.
    pub curator_key_depth: usize,

    /// Validator set used until the curator publishes another one.
    pub initial_validators: Vec<Hash>,

    /// Number of validators expected to publish each round.
    ///
    /// A tip is confirmed once `2 * n / 3` milestones of a round reference it.
    pub number_of_active_validators: usize,

    /// Minimum leading zero bits of a transaction hash.
    pub min_weight_magnitude: u32,

    /// Testnet mode. Allows a zero weight magnitude and skipping milestone
    /// signature checks.
    pub testnet: bool,

    /// Accept milestones without checking their Merkle signature (testnet only).
    pub skip_validator_signature: bool,

    /// Round index of the builtin snapshot.
    pub milestone_start_index: u64,

    /// Base path of the builtin snapshot files, if any.
    ///
    /// The files are `<base>.snapshot.state` and `<base>.snapshot.meta`.
    pub snapshot_file: Option<PathBuf>,

    /// Timestamp of the builtin snapshot, in seconds.
    pub snapshot_timestamp: u64,

    /// Holder of the whole supply when no snapshot file is configured.
    pub genesis_address: Hash,

    /// Take local snapshots.
    pub local_snapshots_enabled: bool,

    /// Rounds kept behind the latest solid round when taking a local snapshot.
    pub local_snapshots_depth: u64,

    /// Rounds kept behind a local snapshot before the range becomes prunable.
    pub local_snapshots_pruning_delay: u64,

    /// Rounds between local snapshots while synced.
    pub local_snapshots_interval_synced: u64,

    /// Rounds between local snapshots while catching up.
    pub local_snapshots_interval_unsynced: u64,

    /// Base path local snapshot files are written to.
    pub local_snapshots_base_path: PathBuf,

    /// Milestone, nominee and latest-solid tracker rescan interval (ms).
    pub tracker_interval_ms: u64,

    /// Solidity propagation interval (ms).
    pub propagation_interval_ms: u64,

    /// Transactions visited per propagation tick.
    pub propagation_scan_limit: usize,

    /// Milestone solidifier interval (ms).
    pub solidifier_interval_ms: u64,

    /// Unsolid milestones checked per solidifier tick.
    pub solidifier_queue_size: usize,

    /// Transactions visited per milestone solidity check.
    pub solidifier_transaction_limit: usize,

    /// Milestone candidates processed per tracker tick.
    pub milestone_batch_size: usize,

    /// Rounds a solid entry point stays relevant when taking a local snapshot.
    pub solid_entry_point_lifetime: u64,

    /// Seconds after a snapshot's timestamp within which an arrival still
    /// counts as attached to the snapshot's history.
    pub solid_entry_point_outer_shell: u64,

    /// Rounds past the latest solid round whose seen milestones are requested.
    pub seen_round_retrieve_range: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            genesis_time: 1_569_024_001_000,
            round_duration: 15_000,
            round_pause: 5_000,
            milestone_key_depth: 10,
            validator_security: 2,
            curator_address: Hash::NULL,
            curator_security: 1,
            curator_key_depth: 15,
            initial_validators: Vec::new(),
            number_of_active_validators: 2,
            min_weight_magnitude: 1,
            testnet: false,
            skip_validator_signature: false,
            milestone_start_index: 0,
            snapshot_file: None,
            snapshot_timestamp: 0,
            genesis_address: Hash::NULL,
            local_snapshots_enabled: false,
            local_snapshots_depth: 100,
            local_snapshots_pruning_delay: 50_000,
            local_snapshots_interval_synced: 10,
            local_snapshots_interval_unsynced: 1_000,
            local_snapshots_base_path: PathBuf::from("local-snapshot"),
            tracker_interval_ms: 1_000,
            propagation_interval_ms: 500,
            propagation_scan_limit: 10_000,
            solidifier_interval_ms: 5_000,
            solidifier_queue_size: 2,
            solidifier_transaction_limit: 50_000,
            milestone_batch_size: 5_000,
            solid_entry_point_lifetime: 1_000,
            solid_entry_point_outer_shell: 100,
            seen_round_retrieve_range: 50,
        }
    }
}

impl ConsensusConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration for local testing: testnet, weight magnitude 0, one
    /// validator, short rounds.
    pub fn testnet() -> Self {
        Self {
            testnet: true,
            min_weight_magnitude: 0,
            number_of_active_validators: 1,
            ..Self::default()
        }
    }

    pub fn round_clock(&self) -> RoundClock {
        RoundClock::new(self.genesis_time, self.round_duration, self.round_pause)
    }

    /// Milestones of one round that must reference a tip to confirm it.
    pub fn quorum(&self) -> usize {
        2 * self.number_of_active_validators / 3
    }

    /// Weight magnitude actually enforced. Only testnets may go below 1.
    pub fn effective_min_weight_magnitude(&self) -> u32 {
        if self.testnet {
            self.min_weight_magnitude
        } else {
            self.min_weight_magnitude.max(1)
        }
    }

    /// Whether milestone signatures are checked.
    pub fn validates_milestone_signatures(&self) -> bool {
        !(self.testnet && self.skip_validator_signature)
    }

    pub fn tracker_interval(&self) -> Duration {
        Duration::from_millis(self.tracker_interval_ms)
    }

    pub fn propagation_interval(&self) -> Duration {
        Duration::from_millis(self.propagation_interval_ms)
    }

    pub fn solidifier_interval(&self) -> Duration {
        Duration::from_millis(self.solidifier_interval_ms)
    }

    /// Reject configurations the consensus core cannot run with.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        let invalid = |reason: String| Err(ConsensusError::Config(reason));
        if self.round_duration == 0 {
            return invalid("round_duration must be positive".into());
        }
        if self.round_pause >= self.round_duration {
            return invalid(format!(
                "round_pause ({}) must be shorter than round_duration ({})",
                self.round_pause, self.round_duration
            ));
        }
        for (name, security) in [
            ("validator_security", self.validator_security),
            ("curator_security", self.curator_security),
        ] {
            if !(1..=tangle_types::winternitz::NUMBER_OF_SECURITY_LEVELS).contains(&security) {
                return invalid(format!("{name} must be between 1 and 4, got {security}"));
            }
        }
        for (name, depth) in [
            ("milestone_key_depth", self.milestone_key_depth),
            ("curator_key_depth", self.curator_key_depth),
        ] {
            if depth > tangle_types::merkle::MAX_DEPTH {
                return invalid(format!(
                    "{name} must not exceed {}, got {depth}",
                    tangle_types::merkle::MAX_DEPTH
                ));
            }
        }
        if self.skip_validator_signature && !self.testnet {
            return invalid("skip_validator_signature requires testnet".into());
        }
        Ok(())
    }
}
