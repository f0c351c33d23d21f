//! Milestone bundle layout.
//!
//! ```text
//! index            signature field         trunk              branch
//! 0..security      OTS fragment            next member        previous round root
//! security         Merkle path             next member        previous round root
//! security+1..     16 tip hashes, NULL-    next member        previous round root
//!                  terminated
//! last (head)                              previous round     root of the tip set
//!                                          root
//! ```
//!
//! Every member's tag carries the round index. The "previous round root" is
//! the Merkle root of the previous round's milestone hashes, and a round's
//! milestones are solid only once everything behind those roots is.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tangle_storage::{StorageError, Tangle};
use tangle_types::merkle::{self, MerkleKeyTree};
use tangle_types::transaction::SIGNATURE_SIZE;
use tangle_types::{bundle_hash, CryptoError, Hash, Round, Transaction, TransactionBuilder};

use crate::bundle_validator::load_members;
use crate::collaborators::TipSelector;
use crate::error::{BundleError, ConsensusError};

/// Hashes carried by one tip transaction.
pub const TIPS_PER_TRANSACTION: usize = SIGNATURE_SIZE / Hash::BYTES;

pub fn is_head(tx: &Transaction) -> bool {
    tx.current_index() == tx.last_index()
}

fn carried_hashes(tx: &Transaction) -> impl Iterator<Item = Hash> + '_ {
    tx.signature()
        .chunks_exact(Hash::BYTES)
        .map(Hash::from_hash_bytes)
        .take_while(|hash| !hash.is_null())
}

/// Tip hashes carried by an ordered milestone bundle.
pub fn tip_set(bundle: &[Transaction], security: usize) -> Vec<Hash> {
    bundle
        .iter()
        .filter(|tx| tx.current_index() > security as u64)
        .flat_map(carried_hashes)
        .collect()
}

/// The ordered bundle of a milestone tail, `None` while it is incomplete.
pub fn milestone_bundle(
    tangle: &Tangle,
    tail: &Hash,
) -> Result<Option<Vec<Transaction>>, StorageError> {
    match load_members(tangle, tail) {
        Ok(bundle) => Ok(Some(bundle)),
        Err(BundleError::Storage(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

/// Tip transactions behind a head, found by walking approvers backwards
/// along the trunk chain. `None` if one is missing.
fn head_tip_set(
    tangle: &Tangle,
    head: &Transaction,
    security: usize,
) -> Result<Option<Vec<Hash>>, StorageError> {
    let mut tips = Vec::new();
    let mut current = head.clone();
    loop {
        if current.current_index() > security as u64 {
            tips.extend(carried_hashes(&current));
        }
        if current.current_index() <= security as u64 + 1 {
            return Ok(Some(tips));
        }
        let previous_index = current.current_index() - 1;
        let mut found = None;
        for approver in tangle.approvers(&current.hash())? {
            if let Some(tx) = tangle.transaction(&approver)? {
                if tx.bundle() == current.bundle()
                    && tx.current_index() == previous_index
                    && tx.trunk() == current.hash()
                {
                    found = Some(tx);
                    break;
                }
            }
        }
        match found {
            Some(tx) => current = tx,
            None => return Ok(None),
        }
    }
}

/// Expand a reference to the previous round's Merkle root into that
/// round's milestone hashes.
///
/// An empty previous round expands to NULL. Rounds at or below the
/// initial snapshot are satisfied without expansion. `None` if the root
/// cannot be resolved yet.
pub fn expand_previous_round(
    tangle: &Tangle,
    round_index: u64,
    root: &Hash,
    initial_index: u64,
) -> Result<Option<Vec<Hash>>, StorageError> {
    let previous = match round_index.checked_sub(1) {
        Some(index) => tangle.round(index)?.map(|round| (index, round)),
        None => None,
    };
    if let Some((_, round)) = &previous {
        if round.merkle_root() == *root {
            if round.is_empty() {
                return Ok(Some(vec![Hash::NULL]));
            }
            return Ok(Some(round.hashes.iter().copied().collect()));
        }
    }
    if root.is_null() {
        return Ok(Some(vec![Hash::NULL]));
    }
    if round_index <= initial_index + 1 {
        return Ok(Some(Vec::new()));
    }
    Ok(None)
}

/// Parents of a milestone bundle member for solidity purposes.
///
/// Non-heads depend on their trunk and on the previous round's
/// milestones. The head depends on the previous round's milestones and on
/// its tip set. `None` if a Merkle root cannot be expanded yet.
pub fn member_parents(
    tangle: &Tangle,
    tx: &Transaction,
    security: usize,
    initial_index: u64,
) -> Result<Option<Vec<Hash>>, StorageError> {
    let round_index = tx.round_index();
    if !is_head(tx) {
        let Some(previous) = expand_previous_round(tangle, round_index, &tx.branch(), initial_index)?
        else {
            return Ok(None);
        };
        let mut parents = vec![tx.trunk()];
        parents.extend(previous);
        return Ok(Some(parents));
    }

    let Some(mut parents) = expand_previous_round(tangle, round_index, &tx.trunk(), initial_index)?
    else {
        return Ok(None);
    };
    let Some(tips) = head_tip_set(tangle, tx, security)? else {
        return Ok(None);
    };
    if merkle::set_root(tips.iter().copied()) != tx.branch() {
        return Ok(None);
    }
    if tips.is_empty() {
        parents.push(Hash::NULL);
    } else {
        parents.extend(tips);
    }
    Ok(Some(parents))
}

/// Tips referenced by at least `quorum` milestones of `round`.
pub fn confirmed_tips(
    tangle: &Tangle,
    round: &Round,
    security: usize,
    quorum: usize,
) -> Result<BTreeSet<Hash>, StorageError> {
    let mut counts: HashMap<Hash, usize> = HashMap::new();
    for milestone in &round.hashes {
        let Some(bundle) = milestone_bundle(tangle, milestone)? else {
            continue;
        };
        let tips: HashSet<Hash> = tip_set(&bundle, security).into_iter().collect();
        for tip in tips {
            *counts.entry(tip).or_default() += 1;
        }
    }
    Ok(counts
        .into_iter()
        .filter(|(_, count)| *count >= quorum)
        .map(|(tip, _)| tip)
        .collect())
}

/// Transactions reachable from `tips` that no other round claimed yet.
///
/// The walk stops at hashes for which `is_boundary` holds and at
/// transactions already assigned to another round.
pub fn referenced_transactions<F>(
    tangle: &Tangle,
    round_index: u64,
    tips: impl IntoIterator<Item = Hash>,
    is_boundary: F,
) -> Result<Vec<Hash>, StorageError>
where
    F: Fn(&Hash) -> bool,
{
    let mut referenced = Vec::new();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<Hash> = tips.into_iter().collect();
    while let Some(hash) = queue.pop_front() {
        if !visited.insert(hash) || is_boundary(&hash) {
            continue;
        }
        let Some((tx, metadata)) = tangle.load(&hash)? else {
            continue;
        };
        if metadata.round_index != 0 && metadata.round_index != round_index {
            continue;
        }
        referenced.push(hash);
        queue.push_back(tx.trunk());
        queue.push_back(tx.branch());
    }
    Ok(referenced)
}

/// Builds a signed milestone bundle.
///
/// Nominee bundles use the same layout, with validator addresses in the
/// tip slots.
#[derive(Debug, Clone, Default)]
pub struct MilestoneBundleBuilder {
    round_index: u64,
    previous_round_root: Hash,
    tips: Vec<Hash>,
    attachment_timestamp: u64,
}

impl MilestoneBundleBuilder {
    pub fn new(round_index: u64) -> Self {
        Self {
            round_index,
            ..Default::default()
        }
    }

    /// Merkle root of the previous round's milestones.
    pub fn previous_round_root(mut self, root: Hash) -> Self {
        self.previous_round_root = root;
        self
    }

    pub fn tips(mut self, tips: impl IntoIterator<Item = Hash>) -> Self {
        self.tips.extend(tips);
        self
    }

    /// Reference the pair of tips chosen by `selector`.
    pub fn tips_from(self, selector: &dyn TipSelector) -> Result<Self, ConsensusError> {
        let (trunk, branch) = selector.select_tips()?;
        Ok(self.tips([trunk, branch]))
    }

    /// Attachment time in milliseconds. The transaction timestamp is the
    /// same instant in seconds.
    pub fn attachment_timestamp(mut self, millis: u64) -> Self {
        self.attachment_timestamp = millis;
        self
    }

    /// Lay out, hash and sign the bundle with key `round_index` of `key`.
    ///
    /// Returns the members in index order, tail first.
    pub fn build(self, key: &MerkleKeyTree) -> Result<Vec<Transaction>, CryptoError> {
        let security = key.security();
        let mut tips = self.tips;
        tips.sort();
        tips.dedup();
        tips.retain(|tip| !tip.is_null());

        let tip_transactions = tips.len().div_ceil(TIPS_PER_TRANSACTION);
        let last_index = (security + tip_transactions) as u64;
        let address = key.root();

        let mut builders: Vec<TransactionBuilder> = (0..=last_index)
            .map(|index| {
                TransactionBuilder::new()
                    .address(&address)
                    .value(0)
                    .timestamp(self.attachment_timestamp / 1000)
                    .current_index(index)
                    .last_index(last_index)
                    .round_index(self.round_index)
                    .attachment_timestamp(self.attachment_timestamp)
            })
            .collect();
        let bundle = bundle_hash(builders.iter().map(TransactionBuilder::essence));

        let signature = key.sign(self.round_index, &bundle)?;
        let path = key.path_bytes(self.round_index)?;
        let mut fields: Vec<Vec<u8>> = signature
            .chunks(SIGNATURE_SIZE)
            .map(<[u8]>::to_vec)
            .collect();
        fields.push(path);
        fields.extend(
            tips.chunks(TIPS_PER_TRANSACTION)
                .map(|chunk| chunk.iter().flat_map(|tip| tip.to_bytes()).collect()),
        );
        for (builder, field) in builders.iter_mut().zip(fields) {
            *builder = builder.clone().signature(&field);
        }

        let tip_root = merkle::set_root(tips.iter().copied());
        let mut trunk = self.previous_round_root;
        let mut members = Vec::with_capacity(builders.len());
        for builder in builders.into_iter().rev() {
            let branch = if members.is_empty() {
                tip_root
            } else {
                self.previous_round_root
            };
            let tx = builder.bundle(&bundle).trunk(&trunk).branch(&branch).build();
            trunk = tx.hash();
            members.push(tx);
        }
        members.reverse();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tangle_storage_memory::MemoryStore;
    use tangle_types::{SpongeMode, TransactionBuilder};

    fn tangle() -> Tangle {
        Tangle::new(Arc::new(MemoryStore::new()))
    }

    fn key() -> MerkleKeyTree {
        MerkleKeyTree::generate(&[1u8; 32], 3, 1).unwrap()
    }

    fn tip(n: u8) -> Hash {
        Hash::new([n; 32])
    }

    fn store(tangle: &Tangle, txs: &[Transaction]) {
        for tx in txs {
            tangle.store_transaction(tx, 0).unwrap();
        }
    }

    #[test]
    fn test_builder_layout() {
        let tips: Vec<Hash> = (1..=20).map(tip).collect();
        let previous = tip(99);
        let bundle = MilestoneBundleBuilder::new(5)
            .previous_round_root(previous)
            .tips(tips.clone())
            .attachment_timestamp(1_600_000_000_123)
            .build(&key())
            .unwrap();

        // 1 fragment + path + 2 tip transactions.
        assert_eq!(bundle.len(), 4);
        assert!(bundle.iter().all(|tx| tx.round_index() == 5));
        assert_eq!(bundle[0].address(), key().root());
        assert_eq!(bundle[0].trunk(), bundle[1].hash());
        assert_eq!(bundle[0].branch(), previous);
        let head = &bundle[3];
        assert!(is_head(head));
        assert_eq!(head.trunk(), previous);
        assert_eq!(head.branch(), merkle::set_root(tips.iter().copied()));
        assert_eq!(head.timestamp(), 1_600_000_000);

        let mut carried = tip_set(&bundle, 1);
        carried.sort();
        assert_eq!(carried, tips);
        assert!(merkle::validate_merkle_signature(
            &bundle,
            SpongeMode::S256,
            &key().root(),
            5,
            1,
            3
        ));
    }

    #[test]
    fn test_bundle_without_tips() {
        let bundle = MilestoneBundleBuilder::new(2).build(&key()).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle[1].branch(), Hash::NULL);
        assert!(tip_set(&bundle, 1).is_empty());
    }

    #[test]
    fn test_expand_previous_round() {
        let tangle = tangle();
        let round = Round::with_hashes(4, [tip(1), tip(2)]);
        tangle.put_round(&round).unwrap();

        let expanded = expand_previous_round(&tangle, 5, &round.merkle_root(), 0)
            .unwrap()
            .unwrap();
        assert_eq!(expanded, vec![tip(1), tip(2)]);
        assert!(expand_previous_round(&tangle, 5, &tip(7), 0).unwrap().is_none());
        // Unknown previous round behind the initial snapshot.
        assert_eq!(
            expand_previous_round(&tangle, 8, &tip(7), 7).unwrap(),
            Some(Vec::new())
        );
        assert_eq!(
            expand_previous_round(&tangle, 9, &Hash::NULL, 0).unwrap(),
            Some(vec![Hash::NULL])
        );

        tangle.put_round(&Round::new(5)).unwrap();
        assert_eq!(
            expand_previous_round(&tangle, 6, &Hash::NULL, 0).unwrap(),
            Some(vec![Hash::NULL])
        );
    }

    #[test]
    fn test_member_parents() {
        let tangle = tangle();
        let previous = Round::with_hashes(4, [tip(50)]);
        tangle.put_round(&previous).unwrap();
        let bundle = MilestoneBundleBuilder::new(5)
            .previous_round_root(previous.merkle_root())
            .tips([tip(1), tip(2)])
            .build(&key())
            .unwrap();
        store(&tangle, &bundle);

        let tail_parents = member_parents(&tangle, &bundle[0], 1, 0).unwrap().unwrap();
        assert_eq!(tail_parents, vec![bundle[1].hash(), tip(50)]);

        let mut head_parents = member_parents(&tangle, &bundle[2], 1, 0).unwrap().unwrap();
        head_parents.sort();
        assert_eq!(head_parents, vec![tip(1), tip(2), tip(50)]);
    }

    #[test]
    fn test_head_without_its_tip_transactions_is_unresolved() {
        let tangle = tangle();
        let bundle = MilestoneBundleBuilder::new(5)
            .tips((1..=20).map(tip))
            .build(&key())
            .unwrap();
        // Store the head only.
        tangle.store_transaction(&bundle[3], 0).unwrap();
        assert!(member_parents(&tangle, &bundle[3], 1, 4)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_confirmed_tips_respects_quorum() {
        let tangle = tangle();
        let a = MilestoneBundleBuilder::new(3)
            .tips([tip(1), tip(2)])
            .build(&MerkleKeyTree::generate(&[1u8; 32], 3, 1).unwrap())
            .unwrap();
        let b = MilestoneBundleBuilder::new(3)
            .tips([tip(2), tip(3)])
            .build(&MerkleKeyTree::generate(&[2u8; 32], 3, 1).unwrap())
            .unwrap();
        store(&tangle, &a);
        store(&tangle, &b);
        let round = Round::with_hashes(3, [a[0].hash(), b[0].hash()]);

        let quorum_two = confirmed_tips(&tangle, &round, 1, 2).unwrap();
        assert_eq!(quorum_two.into_iter().collect::<Vec<_>>(), vec![tip(2)]);
        assert_eq!(confirmed_tips(&tangle, &round, 1, 1).unwrap().len(), 3);
    }

    #[test]
    fn test_referenced_transactions_stop_at_other_rounds() {
        let tangle = tangle();
        let old = TransactionBuilder::new().nonce(1).build();
        let mid = TransactionBuilder::new().nonce(2).trunk(&old.hash()).build();
        let top = TransactionBuilder::new()
            .nonce(3)
            .trunk(&mid.hash())
            .branch(&old.hash())
            .build();
        store(&tangle, &[old.clone(), mid.clone(), top.clone()]);
        tangle
            .update_metadata(&old.hash(), |m| m.round_index = 2)
            .unwrap();

        let mut referenced =
            referenced_transactions(&tangle, 3, [top.hash()], |h| h.is_null()).unwrap();
        referenced.sort();
        let mut expected = vec![top.hash(), mid.hash()];
        expected.sort();
        assert_eq!(referenced, expected);
    }
}
