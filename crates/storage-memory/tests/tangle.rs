//! Tangle facade behaviour over the in-memory backend.

use std::sync::Arc;

use tangle_storage::{Column, KvStore, Tangle};
use tangle_storage_memory::MemoryStore;
use tangle_types::{Hash, Round, StateDiff, TransactionBuilder, Validity};

fn tangle() -> (Tangle, MemoryStore) {
    let store = MemoryStore::new();
    (Tangle::new(Arc::new(store.clone())), store)
}

fn tx(trunk: &Hash, branch: &Hash, nonce: u64) -> tangle_types::Transaction {
    TransactionBuilder::new()
        .address(&Hash::new([7; 32]))
        .bundle(&Hash::new([9; 32]))
        .trunk(trunk)
        .branch(branch)
        .nonce(nonce)
        .build()
}

#[test]
fn test_store_writes_all_indexes() {
    let (tangle, store) = tangle();
    let parent = tx(&Hash::NULL, &Hash::NULL, 1);
    let child = tx(&parent.hash(), &Hash::NULL, 2);

    assert!(tangle.store_transaction(&parent, 10).unwrap());
    assert!(tangle.store_transaction(&child, 20).unwrap());
    assert!(!tangle.store_transaction(&child, 30).unwrap());

    assert_eq!(tangle.approvers(&parent.hash()).unwrap(), vec![child.hash()]);
    let mut null_approvers = tangle.approvers(&Hash::NULL).unwrap();
    null_approvers.sort();
    let mut expected = vec![parent.hash(), child.hash()];
    expected.sort();
    assert_eq!(null_approvers, expected);

    assert_eq!(tangle.bundle_transactions(&Hash::new([9; 32])).unwrap().len(), 2);
    assert_eq!(tangle.address_transactions(&Hash::new([7; 32])).unwrap().len(), 2);
    assert_eq!(store.column_len(Column::Transaction), 2);

    // Duplicate store keeps the first arrival time.
    assert_eq!(tangle.metadata(&child.hash()).unwrap().unwrap().arrival_time, 20);
}

#[test]
fn test_transaction_survives_cache_eviction() {
    let store = MemoryStore::new();
    let tangle = Tangle::with_cache_capacity(Arc::new(store.clone()), tangle_metrics::noop(), 1);
    let a = tx(&Hash::NULL, &Hash::NULL, 1);
    let b = tx(&Hash::NULL, &Hash::NULL, 2);
    tangle.store_transaction(&a, 0).unwrap();
    tangle.store_transaction(&b, 0).unwrap();

    assert_eq!(tangle.transaction(&a.hash()).unwrap(), Some(a.clone()));
    assert_eq!(tangle.transaction(&b.hash()).unwrap(), Some(b));
    assert!(tangle.transaction(&Hash::new([1; 32])).unwrap().is_none());
    assert!(tangle.exists(&a.hash()).unwrap());
}

#[test]
fn test_update_metadata() {
    let (tangle, _) = tangle();
    let a = tx(&Hash::NULL, &Hash::NULL, 1);
    tangle.store_transaction(&a, 5).unwrap();

    let updated = tangle
        .update_metadata(&a.hash(), |m| {
            m.solid = true;
            m.validity = Validity::Valid;
        })
        .unwrap()
        .unwrap();
    assert!(updated.solid);

    let (_, meta) = tangle.load(&a.hash()).unwrap().unwrap();
    assert_eq!(meta.validity, Validity::Valid);
    assert_eq!(meta.arrival_time, 5);

    assert!(tangle
        .update_metadata(&Hash::new([3; 32]), |m| m.solid = true)
        .unwrap()
        .is_none());
}

#[test]
fn test_round_navigation() {
    let (tangle, _) = tangle();
    assert!(tangle.latest_round().unwrap().is_none());
    for index in [3u64, 7, 12] {
        tangle
            .put_round(&Round::with_hashes(index, [Hash::new([index as u8; 32])]))
            .unwrap();
    }

    assert_eq!(tangle.first_round().unwrap().unwrap().index, 3);
    assert_eq!(tangle.latest_round().unwrap().unwrap().index, 12);
    assert_eq!(tangle.next_round(3).unwrap().unwrap().index, 7);
    assert_eq!(tangle.next_round(4).unwrap().unwrap().index, 7);
    assert!(tangle.next_round(12).unwrap().is_none());
    assert_eq!(tangle.prev_round(12).unwrap().unwrap().index, 7);
    assert!(tangle.prev_round(3).unwrap().is_none());
    assert!(tangle.prev_round(0).unwrap().is_none());

    assert!(tangle.closest_next_round(7, 11).unwrap().is_none());
    assert_eq!(tangle.closest_prev_round(11, 3).unwrap().unwrap().index, 7);
    assert!(tangle.closest_prev_round(6, 3).unwrap().is_none());

    let round = tangle.round(7).unwrap().unwrap();
    assert!(round.contains(&Hash::new([7; 32])));

    tangle.delete_round(7).unwrap();
    assert!(!tangle.round_exists(7).unwrap());
    assert_eq!(tangle.next_round(3).unwrap().unwrap().index, 12);
}

#[test]
fn test_state_diff_storage() {
    let (tangle, store) = tangle();
    let diff = StateDiff::new(4, [(Hash::new([1; 32]), -5), (Hash::new([2; 32]), 5)].into());
    tangle.put_state_diff(&diff).unwrap();
    assert_eq!(tangle.state_diff(4).unwrap(), Some(diff));
    assert!(tangle.state_diff(5).unwrap().is_none());

    store.put(Column::StateDiff, &6u64.to_be_bytes(), b"garbage").unwrap();
    assert!(tangle.state_diff(6).is_err());

    tangle.delete_state_diff(4).unwrap();
    assert!(tangle.state_diff(4).unwrap().is_none());
}
