//! Ledger snapshots: balances plus the metadata describing where they stand.

use std::collections::{BTreeSet, HashMap};

use crate::state_diff::StateDiff;
use crate::transaction::SUPPLY;
use crate::Hash;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("State diff for round {0} does not balance to zero")]
    InconsistentDiff(u64),

    #[error("Balance overflow for address {0}")]
    Overflow(Hash),
}

/// Address balances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotState {
    balances: HashMap<Hash, i64>,
}

impl SnapshotState {
    pub fn new(balances: HashMap<Hash, i64>) -> Self {
        Self { balances }
    }

    pub fn balances(&self) -> &HashMap<Hash, i64> {
        &self.balances
    }

    pub fn balance(&self, address: &Hash) -> Option<i64> {
        self.balances.get(address).copied()
    }

    /// No balance is negative.
    pub fn is_consistent(&self) -> bool {
        self.balances.values().all(|&b| b >= 0)
    }

    pub fn has_correct_supply(&self) -> bool {
        self.balances.values().map(|&b| i128::from(b)).sum::<i128>() == i128::from(SUPPLY)
    }

    /// Balances of the addresses `diff` touches, as they would be after applying it.
    pub fn patched_state(&self, diff: &StateDiff) -> SnapshotState {
        let balances = diff
            .diff
            .iter()
            .map(|(address, delta)| {
                let current = self.balances.get(address).copied().unwrap_or(0);
                (*address, current.saturating_add(*delta))
            })
            .collect();
        SnapshotState { balances }
    }

    /// Apply a balanced diff. Zero balances are dropped.
    pub fn apply_state_diff(&mut self, diff: &StateDiff) -> Result<(), StateError> {
        if !diff.is_consistent() {
            return Err(StateError::InconsistentDiff(diff.index));
        }
        for (address, delta) in &diff.diff {
            let current = self.balances.get(address).copied().unwrap_or(0);
            let updated = current
                .checked_add(*delta)
                .ok_or(StateError::Overflow(*address))?;
            if updated == 0 {
                self.balances.remove(address);
            } else {
                self.balances.insert(*address, updated);
            }
        }
        Ok(())
    }
}

/// Where a snapshot stands, and the boundary data it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMetaData {
    /// Hash, index and timestamp of the snapshot this one was derived from.
    pub initial_hash: Hash,
    pub initial_index: u64,
    pub initial_timestamp: u64,

    /// Snapshot hash of the last applied round.
    pub hash: Hash,
    /// Last applied round.
    pub index: u64,
    /// Start of the last applied round, in seconds.
    pub timestamp: u64,

    /// Transactions treated as solid without their history, with the round
    /// they were recorded at.
    pub solid_entry_points: HashMap<Hash, u64>,
    /// Rounds known past this snapshot, with their milestone hashes.
    pub seen_rounds: HashMap<u64, Vec<Hash>>,
}

impl SnapshotMetaData {
    pub fn new(hash: Hash, index: u64, timestamp: u64) -> Self {
        Self {
            initial_hash: hash,
            initial_index: index,
            initial_timestamp: timestamp,
            hash,
            index,
            timestamp,
            solid_entry_points: HashMap::new(),
            seen_rounds: HashMap::new(),
        }
    }

    pub fn has_solid_entry_point(&self, hash: &Hash) -> bool {
        self.solid_entry_points.contains_key(hash)
    }

    /// Recorded round of a solid entry point.
    pub fn solid_entry_point_index(&self, hash: &Hash) -> Option<u64> {
        self.solid_entry_points.get(hash).copied()
    }
}

/// Balances plus metadata plus the rounds skipped while replaying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub state: SnapshotState,
    pub metadata: SnapshotMetaData,
    skipped_rounds: BTreeSet<u64>,
}

impl Snapshot {
    pub fn new(state: SnapshotState, metadata: SnapshotMetaData) -> Self {
        Self {
            state,
            metadata,
            skipped_rounds: BTreeSet::new(),
        }
    }

    pub fn index(&self) -> u64 {
        self.metadata.index
    }

    pub fn hash(&self) -> Hash {
        self.metadata.hash
    }

    pub fn timestamp(&self) -> u64 {
        self.metadata.timestamp
    }

    pub fn initial_index(&self) -> u64 {
        self.metadata.initial_index
    }

    pub fn has_solid_entry_point(&self, hash: &Hash) -> bool {
        self.metadata.has_solid_entry_point(hash)
    }

    /// Record that `index` had no round when replaying past it.
    pub fn add_skipped_round(&mut self, index: u64) {
        self.skipped_rounds.insert(index);
    }

    /// Returns `true` if `index` was recorded as skipped.
    pub fn remove_skipped_round(&mut self, index: u64) -> bool {
        self.skipped_rounds.remove(&index)
    }

    pub fn skipped_rounds(&self) -> &BTreeSet<u64> {
        &self.skipped_rounds
    }

    /// Replace everything with `other`'s contents.
    pub fn update(&mut self, other: &Snapshot) {
        self.clone_from(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Hash {
        Hash::new([n; 32])
    }

    #[test]
    fn test_supply_and_consistency() {
        let state = SnapshotState::new([(addr(1), SUPPLY)].into());
        assert!(state.has_correct_supply());
        assert!(state.is_consistent());

        let state = SnapshotState::new([(addr(1), SUPPLY + 1), (addr(2), -1)].into());
        assert!(state.has_correct_supply());
        assert!(!state.is_consistent());
    }

    #[test]
    fn test_apply_drops_zero_balances() {
        let mut state = SnapshotState::new([(addr(1), 100)].into());
        let diff = StateDiff::new(1, [(addr(1), -100), (addr(2), 100)].into());
        state.apply_state_diff(&diff).unwrap();
        assert_eq!(state.balance(&addr(1)), None);
        assert_eq!(state.balance(&addr(2)), Some(100));
    }

    #[test]
    fn test_apply_rejects_unbalanced() {
        let mut state = SnapshotState::default();
        let diff = StateDiff::new(4, [(addr(1), 1)].into());
        assert_eq!(state.apply_state_diff(&diff), Err(StateError::InconsistentDiff(4)));
    }

    #[test]
    fn test_patched_state_detects_overdraft() {
        let state = SnapshotState::new([(addr(1), 10)].into());
        let diff = StateDiff::new(1, [(addr(1), -11), (addr(2), 11)].into());
        assert!(!state.patched_state(&diff).is_consistent());
    }

    #[test]
    fn test_skipped_rounds() {
        let mut snapshot = Snapshot::default();
        snapshot.add_skipped_round(3);
        assert!(snapshot.remove_skipped_round(3));
        assert!(!snapshot.remove_skipped_round(3));
    }
}
