//! Test helpers for the Tangle node: deterministic validator keys, signed
//! bundle fixtures and a fully wired consensus context over the in-memory
//! store.
//!
//! # Example
//!
//! ```rust
//! use tangle_test_helpers::TestValidators;
//!
//! let validators = TestValidators::new(2, 42);
//! let bundle = validators.milestone(0, 3, 46_000, Vec::new());
//! assert_eq!(bundle[0].address(), validators.address(0));
//! ```

pub mod context;
pub mod fixtures;

pub use context::{RecordingRequestQueue, TestContext};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tangle_consensus::MilestoneBundleBuilder;
use tangle_types::{Hash, MerkleKeyTree, Transaction};

/// Merkle key depth of test validators. Covers rounds `0..64`.
pub const TEST_KEY_DEPTH: usize = 6;

/// Signature fragments of test milestones.
pub const TEST_SECURITY: usize = 1;

/// Validators with deterministic Merkle keys.
pub struct TestValidators {
    keys: Vec<MerkleKeyTree>,
}

impl std::fmt::Debug for TestValidators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestValidators")
            .field("addresses", &self.addresses())
            .finish()
    }
}

impl TestValidators {
    /// `size` validators whose seeds are drawn from a ChaCha stream seeded
    /// with `seed`. The same seed always yields the same addresses.
    pub fn new(size: usize, seed: u64) -> Self {
        Self::with_depth(size, seed, TEST_KEY_DEPTH)
    }

    pub fn with_depth(size: usize, seed: u64, depth: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let keys = (0..size)
            .map(|_| {
                let mut key_seed = [0u8; 32];
                rng.fill_bytes(&mut key_seed);
                MerkleKeyTree::generate(&key_seed, depth, TEST_SECURITY)
                    .expect("test key generation")
            })
            .collect();
        Self { keys }
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    /// # Panics
    ///
    /// Panics if `idx >= size()`.
    pub fn key(&self, idx: usize) -> &MerkleKeyTree {
        &self.keys[idx]
    }

    pub fn address(&self, idx: usize) -> Hash {
        self.keys[idx].root()
    }

    pub fn addresses(&self) -> Vec<Hash> {
        self.keys.iter().map(MerkleKeyTree::root).collect()
    }

    /// A milestone of validator `idx` for `round`, attached at `attached`
    /// (ms), confirming `tips`.
    pub fn milestone(&self, idx: usize, round: u64, attached: u64, tips: Vec<Hash>) -> Vec<Transaction> {
        self.milestone_after(idx, round, attached, tips, Hash::NULL)
    }

    /// Like [`milestone`](Self::milestone), referencing the previous round by
    /// `previous_root`.
    pub fn milestone_after(
        &self,
        idx: usize,
        round: u64,
        attached: u64,
        tips: Vec<Hash>,
        previous_root: Hash,
    ) -> Vec<Transaction> {
        MilestoneBundleBuilder::new(round)
            .previous_round_root(previous_root)
            .tips(tips)
            .attachment_timestamp(attached)
            .build(&self.keys[idx])
            .expect("round within test key range")
    }
}
