//! Rounds and the round clock.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::merkle;
use crate::Hash;

/// Round indices live in `[0, ROUND_INDEX_CEILING)`.
pub const ROUND_INDEX_CEILING: u64 = 0x20_0000;

/// Snapshot hash used for rounds that finished without milestones.
pub const EMPTY_ROUND_HASH: Hash = Hash::new([
    0xaf, 0x0b, 0x52, 0x02, 0xd1, 0x1a, 0x6f, 0x5a, 0x50, 0x69, 0x2a, 0x1c, 0x3e, 0x05, 0x57, 0x5b,
    0x0b, 0x71, 0x82, 0x43, 0x41, 0xb1, 0x47, 0x21, 0x7a, 0x0f, 0x4c, 0xe0, 0x70, 0x5c, 0xd5, 0x3e,
]);

/// A consensus epoch and the milestones recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub index: u64,
    pub hashes: BTreeSet<Hash>,
}

impl Round {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            hashes: BTreeSet::new(),
        }
    }

    pub fn with_hashes<I: IntoIterator<Item = Hash>>(index: u64, hashes: I) -> Self {
        Self {
            index,
            hashes: hashes.into_iter().collect(),
        }
    }

    /// Returns `true` if the hash was not yet part of the round.
    pub fn add_milestone(&mut self, hash: Hash) -> bool {
        self.hashes.insert(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Set-tree root of the milestone hashes.
    pub fn merkle_root(&self) -> Hash {
        merkle::set_root(self.hashes.iter().copied())
    }

    /// The hash a snapshot records after applying this round.
    pub fn snapshot_hash(&self) -> Hash {
        let root = self.merkle_root();
        if root.is_null() {
            EMPTY_ROUND_HASH
        } else {
            root
        }
    }
}

/// Maps wall-clock milliseconds to round indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundClock {
    /// Start of round 0, in milliseconds since the epoch.
    pub genesis_time: u64,
    /// Length of a round in milliseconds.
    pub round_duration: u64,
    /// Tail of each round during which milestones are no longer accepted.
    pub round_pause: u64,
}

impl RoundClock {
    pub fn new(genesis_time: u64, round_duration: u64, round_pause: u64) -> Self {
        Self {
            genesis_time,
            round_duration: round_duration.max(1),
            round_pause,
        }
    }

    /// `round(t) = floor((t - genesis) / duration)`, 0 before genesis.
    pub fn round(&self, time: u64) -> u64 {
        (time.saturating_sub(self.genesis_time) / self.round_duration) & (ROUND_INDEX_CEILING - 1)
    }

    /// Whether `time` falls in the open (non-pause) part of its round.
    pub fn is_round_active(&self, time: u64) -> bool {
        let offset = time.saturating_sub(self.genesis_time) % self.round_duration;
        offset < self.round_duration.saturating_sub(self.round_pause)
    }

    pub fn round_start(&self, index: u64) -> u64 {
        self.genesis_time + index * self.round_duration
    }

    /// Timestamp recorded in a snapshot after applying round `index`, in seconds.
    pub fn round_timestamp_secs(&self, index: u64) -> u64 {
        self.round_start(index) / 1000
    }
}
