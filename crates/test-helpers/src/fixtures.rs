//! Transaction and bundle fixtures.

use tangle_types::sponge::SpongeMode;
use tangle_types::{bundle_hash, winternitz, Hash, Transaction, TransactionBuilder};

/// Seed of the address that holds the genesis supply in test contexts.
pub const GENESIS_SEED: &[u8] = &[0x5e; 32];

/// Address of key `index` of `seed`, one fragment.
pub fn address_of(seed: &[u8], index: u64) -> Hash {
    Hash::from(winternitz::generate_address(seed, index, 1).expect("valid test seed"))
}

/// The address holding the whole supply in a [`TestContext`](crate::TestContext).
pub fn genesis_address() -> Hash {
    address_of(GENESIS_SEED, 0)
}

/// A zero-value transaction approving `trunk` and `branch`.
pub fn plain_tx(nonce: u64, trunk: &Hash, branch: &Hash) -> Transaction {
    TransactionBuilder::new()
        .nonce(nonce)
        .trunk(trunk)
        .branch(branch)
        .build()
}

/// A trunk-chained bundle, tail first, whose first transaction spends from
/// key 0 of `seed` and carries a one-fragment signature.
///
/// The members after the first receive on addresses `[i + 1; 32]`. The head
/// approves `trunk` and every member approves `branch`.
pub fn signed_bundle(seed: &[u8], values: &[i64], trunk: &Hash, branch: &Hash) -> Vec<Transaction> {
    let builders = bundle_builders(seed, values);
    let hash = bundle_hash(builders.iter().map(TransactionBuilder::essence));
    let signature = winternitz::signature_fragments(SpongeMode::S256, seed, 0, 1, hash.as_bytes())
        .expect("valid test seed");
    let mut builders = builders;
    builders[0] = builders[0].clone().signature(&signature);
    chain(builders, &hash, trunk, branch)
}

/// Like [`signed_bundle`], with one bit of the tail's signature flipped.
pub fn corrupted_bundle(seed: &[u8], values: &[i64], trunk: &Hash, branch: &Hash) -> Vec<Transaction> {
    let builders = bundle_builders(seed, values);
    let hash = bundle_hash(builders.iter().map(TransactionBuilder::essence));
    let mut signature = winternitz::signature_fragments(SpongeMode::S256, seed, 0, 1, hash.as_bytes())
        .expect("valid test seed");
    signature[5] ^= 0x01;
    let mut builders = builders;
    builders[0] = builders[0].clone().signature(&signature);
    chain(builders, &hash, trunk, branch)
}

/// A signed transfer of `amount` from the genesis address to `[2; 32]`.
pub fn genesis_transfer(amount: i64, trunk: &Hash, branch: &Hash) -> Vec<Transaction> {
    signed_bundle(GENESIS_SEED, &[-amount, amount], trunk, branch)
}

fn bundle_builders(seed: &[u8], values: &[i64]) -> Vec<TransactionBuilder> {
    let last = values.len().saturating_sub(1) as u64;
    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let address = if i == 0 {
                address_of(seed, 0)
            } else {
                Hash::new([i as u8 + 1; 32])
            };
            TransactionBuilder::new()
                .address(&address)
                .value(value)
                .current_index(i as u64)
                .last_index(last)
        })
        .collect()
}

fn chain(builders: Vec<TransactionBuilder>, bundle: &Hash, trunk: &Hash, branch: &Hash) -> Vec<Transaction> {
    let mut next = *trunk;
    let mut members: Vec<Transaction> = builders
        .into_iter()
        .rev()
        .map(|builder| {
            let tx = builder.bundle(bundle).trunk(&next).branch(branch).build();
            next = tx.hash();
            tx
        })
        .collect();
    members.reverse();
    members
}
