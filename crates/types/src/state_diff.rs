//! Per-round balance deltas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Hash;

/// The balance changes one round introduced, keyed by address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    pub index: u64,
    pub diff: BTreeMap<Hash, i64>,
}

impl StateDiff {
    pub fn new(index: u64, diff: BTreeMap<Hash, i64>) -> Self {
        Self { index, diff }
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    /// Deltas of a consistent diff sum to zero.
    pub fn is_consistent(&self) -> bool {
        self.diff.values().map(|&v| i128::from(v)).sum::<i128>() == 0
    }

    /// The diff that undoes this one.
    pub fn negated(&self) -> Self {
        Self {
            index: self.index,
            diff: self.diff.iter().map(|(k, v)| (*k, v.wrapping_neg())).collect(),
        }
    }

    /// Add `other`'s deltas into this diff, dropping entries that cancel out.
    pub fn merge(&mut self, other: &StateDiff) {
        for (address, delta) in &other.diff {
            let entry = self.diff.entry(*address).or_insert(0);
            *entry = entry.saturating_add(*delta);
            if *entry == 0 {
                self.diff.remove(address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Hash {
        Hash::new([n; 32])
    }

    #[test]
    fn test_consistency() {
        let diff = StateDiff::new(1, [(addr(1), -5), (addr(2), 5)].into());
        assert!(diff.is_consistent());
        let diff = StateDiff::new(1, [(addr(1), -5), (addr(2), 4)].into());
        assert!(!diff.is_consistent());
    }

    #[test]
    fn test_negate_and_merge_cancel() {
        let diff = StateDiff::new(3, [(addr(1), -5), (addr(2), 5)].into());
        let mut merged = diff.clone();
        merged.merge(&diff.negated());
        assert!(merged.is_empty());
    }
}
