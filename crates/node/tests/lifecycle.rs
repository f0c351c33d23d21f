//! A node over the in-memory store, with real worker threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tangle_consensus::{ConsensusConfig, ManualClock, NoopRequestQueue};
use tangle_node::{Node, NodeServices};
use tangle_storage_memory::MemoryStore;
use tangle_test_helpers::context::TEST_ROUND_DURATION;
use tangle_test_helpers::fixtures::genesis_transfer;
use tangle_test_helpers::{TestContext, TestValidators};
use tangle_types::Hash;
use tracing_test::traced_test;

fn fast(mut config: ConsensusConfig) -> ConsensusConfig {
    config.tracker_interval_ms = 10;
    config.propagation_interval_ms = 10;
    config.solidifier_interval_ms = 10;
    config
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
#[traced_test]
fn test_workers_confirm_a_transfer() {
    let validators = TestValidators::new(1, 42);
    let config = fast(TestContext::config_for(&validators));
    let clock = Arc::new(ManualClock::new(TEST_ROUND_DURATION + 1_000));
    let services = NodeServices::new(Arc::new(MemoryStore::new()), Arc::new(NoopRequestQueue))
        .with_clock(clock.clone());
    let node = Node::start(config, services).unwrap();
    let ctx = node.context();

    let transfer = genesis_transfer(300, &Hash::NULL, &Hash::NULL);
    let milestone = validators.milestone(0, 1, TEST_ROUND_DURATION + 1_000, vec![transfer[0].hash()]);
    // Milestone first: the tracker has to wait for its tips.
    for tx in milestone.iter().chain(&transfer) {
        ctx.tangle.store_transaction(tx, 0).unwrap();
    }

    wait_for("round 1 to be recorded", || {
        ctx.tangle.round(1).unwrap().is_some_and(|r| r.contains(&milestone[0].hash()))
    });
    assert_eq!(ctx.provider.latest_index(), 0);

    clock.set(2 * TEST_ROUND_DURATION + 1_000);
    wait_for("round 1 to be applied", || ctx.provider.latest_index() == 1);
    assert_eq!(
        ctx.provider.latest().state.balance(&Hash::new([2; 32])),
        Some(300)
    );
    assert!(ctx.tracker.is_initial_scan_complete());

    node.stop();
}

#[test]
#[traced_test]
fn test_restart_keeps_ledger() {
    let validators = TestValidators::new(1, 42);
    let config = fast(TestContext::config_for(&validators));
    let store = Arc::new(MemoryStore::new());
    let ctx = TestContext::on_tangle(
        config.clone(),
        validators,
        Arc::new(tangle_storage::Tangle::new(store.clone())),
    );
    let transfer = genesis_transfer(300, &Hash::NULL, &Hash::NULL);
    ctx.store(&transfer);
    let milestone = ctx.publish_milestone(0, 1, vec![transfer[0].hash()]);
    assert!(ctx.solidify(&milestone[0].hash()));
    ctx.close_round(1);
    ctx.advance_ledger();
    assert_eq!(ctx.provider.latest_index(), 1);

    let services = NodeServices::new(store, Arc::new(NoopRequestQueue))
        .with_clock(Arc::new(ManualClock::new(2 * TEST_ROUND_DURATION + 1_000)));
    let node = Node::start(config, services).unwrap();
    assert_eq!(node.context().provider.latest_index(), 1);
    node.stop();
}
