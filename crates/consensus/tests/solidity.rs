//! Solidity over a small DAG stored out of order.

use tangle_consensus::StopFlag;
use tangle_test_helpers::fixtures::plain_tx;
use tangle_test_helpers::TestContext;
use tangle_types::{Hash, Transaction};
use tracing_test::traced_test;

/// Thirty transactions; each approves two earlier ones, the first two
/// approve NULL.
fn dag() -> Vec<Transaction> {
    let mut txs: Vec<Transaction> = Vec::new();
    for i in 0..30u64 {
        let (trunk, branch) = if i < 2 {
            (Hash::NULL, Hash::NULL)
        } else {
            let n = i as usize;
            (txs[n - 1].hash(), txs[(n * 7 + 3) % (n - 1)].hash())
        };
        txs.push(plain_tx(i + 1, &trunk, &branch));
    }
    txs
}

fn is_solid(ctx: &TestContext, hash: &Hash) -> bool {
    ctx.provider.is_solid_entry_point(hash) || ctx.transactions.is_solid(hash).unwrap()
}

fn assert_solid_closure(ctx: &TestContext, txs: &[Transaction]) {
    for tx in txs {
        if ctx.transactions.is_solid(&tx.hash()).unwrap() {
            assert!(is_solid(ctx, &tx.trunk()), "trunk of solid {} unsolid", tx.hash());
            assert!(is_solid(ctx, &tx.branch()), "branch of solid {} unsolid", tx.hash());
        }
    }
}

#[test]
#[traced_test]
fn test_propagation_solidifies_whole_dag() {
    let ctx = TestContext::new(1);
    let txs = dag();
    for tx in txs.iter().rev() {
        ctx.store(std::slice::from_ref(tx));
        // Only the two roots can be solid on arrival.
        ctx.transactions.check_solidity(&tx.hash()).unwrap();
        assert_solid_closure(&ctx, &txs);
    }

    let stop = StopFlag::new();
    for _ in 0..txs.len() {
        if ctx.propagator.propagate(&stop).unwrap() == 0 && ctx.transactions.solid_queue().is_empty() {
            break;
        }
        assert_solid_closure(&ctx, &txs);
    }
    assert!(txs.iter().all(|tx| ctx.transactions.is_solid(&tx.hash()).unwrap()));
}

#[test]
#[traced_test]
fn test_deep_check_waits_for_missing_ancestor() {
    let ctx = TestContext::new(1);
    let txs = dag();
    let missing = txs[5].hash();
    for tx in txs.iter().filter(|tx| tx.hash() != missing) {
        ctx.store(std::slice::from_ref(tx));
    }
    let tip = txs[29].hash();

    assert!(!ctx.transactions.check_solidity_deep(&tip, false, 1_000).unwrap());
    assert!(ctx.requests.was_requested(&missing));
    assert!(!ctx.requests.was_requested_for_milestone(&missing));
    assert!(!ctx.transactions.is_solid(&tip).unwrap());
    assert_solid_closure(&ctx, &txs);

    ctx.store(&txs[5..6]);
    assert!(ctx.transactions.check_solidity_deep(&tip, false, 1_000).unwrap());
    assert_solid_closure(&ctx, &txs);
}

#[test]
#[traced_test]
fn test_deep_check_respects_limit() {
    let ctx = TestContext::new(1);
    let txs = dag();
    ctx.store(&txs);
    let tip = txs[29].hash();

    assert!(!ctx.transactions.check_solidity_deep(&tip, false, 3).unwrap());
    assert!(!ctx.transactions.is_solid(&tip).unwrap());
    assert!(ctx.transactions.check_solidity_deep(&tip, false, 100).unwrap());
}
