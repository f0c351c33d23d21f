//! Core types for the Tangle node.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: [`Hash`], the [`Sponge`], Winternitz one-time signatures
//!   and Merkle trees
//! - **Ledger objects**: [`Transaction`], [`Round`], [`StateDiff`], [`Snapshot`]
//! - **Time**: [`RoundClock`], mapping wall-clock time to round indices
//!
//! It does not depend on any other workspace crate.

mod hash;
pub mod merkle;
mod round;
mod snapshot;
pub mod sponge;
mod state_diff;
pub mod transaction;
pub mod winternitz;

pub use hash::{Hash, HexError};
pub use merkle::MerkleKeyTree;
pub use round::{Round, RoundClock, EMPTY_ROUND_HASH, ROUND_INDEX_CEILING};
pub use snapshot::{Snapshot, SnapshotMetaData, SnapshotState, StateError};
pub use sponge::{CryptoError, Sponge, SpongeMode};
pub use state_diff::StateDiff;
pub use transaction::{
    bundle_hash, Transaction, TransactionBuilder, TransactionError, TransactionMetadata, Validity,
    SUPPLY,
};
