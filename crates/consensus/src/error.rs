//! Error types for the consensus core.

use std::path::PathBuf;

use tangle_storage::StorageError;
use tangle_types::{CryptoError, Hash, StateError};

/// Why a bundle failed to load or validate.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("Transaction {0} is not a bundle tail")]
    NotTail(Hash),

    /// A member is not stored yet. The bundle may still become valid.
    #[error("Bundle member {0} is missing")]
    Missing(Hash),

    #[error("Bundle {bundle} has no transaction at index {index}")]
    MissingIndex { bundle: Hash, index: u64 },

    #[error("Bundle {bundle}: transaction {index} does not chain to its predecessor")]
    BrokenChain { bundle: Hash, index: u64 },

    #[error("Bundle {bundle} has {actual} transactions, expected {expected}")]
    SizeMismatch {
        bundle: Hash,
        expected: u64,
        actual: u64,
    },

    #[error("Bundle {bundle} value leaves the supply range at index {index}")]
    ValueOutOfRange { bundle: Hash, index: u64 },

    #[error("Bundle {bundle} values sum to {sum}")]
    UnbalancedValue { bundle: Hash, sum: i128 },

    #[error("Bundle hash mismatch: recorded {recorded}, computed {computed}")]
    HashMismatch { recorded: Hash, computed: Hash },

    #[error("Invalid signature for address {address} at index {index}")]
    InvalidSignature { address: Hash, index: u64 },

    /// The same member set was already found invalid.
    #[error("Bundle of {0} was already found invalid")]
    CachedInvalid(Hash),

    #[error("Bundle digest failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BundleError {
    /// Whether more data could still make the bundle valid.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, BundleError::Missing(_))
    }
}

/// Structural rejection of a single transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Stale timestamp on transaction {0}")]
    StaleTimestamp(Hash),

    #[error("Invalid transaction {hash}: {reason}")]
    InvalidState { hash: Hash, reason: String },
}

/// Snapshot replay, rollback and file errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Cannot roll back to round {target}: allowed range is ({initial}, {latest}]")]
    InvalidRollbackTarget { target: u64, initial: u64, latest: u64 },

    #[error("Round {0} leaves the ledger inconsistent")]
    InconsistentState(u64),

    #[error("Snapshot state does not hold the full supply")]
    IncorrectSupply,

    #[error("Cannot generate a snapshot for round {target}: outside ({initial}, {latest}]")]
    TargetOutOfRange { target: u64, initial: u64, latest: u64 },

    #[error("No round at or below {0} to snapshot")]
    NoTargetRound(u64),

    #[error("Failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed snapshot file {path}, line {line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Ledger application errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Balance overflow on address {0}")]
    BalanceOverflow(Hash),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Top-level error type for the consensus core.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown transaction {0}")]
    UnknownTransaction(Hash),

    #[error("Round index {0} cannot be assigned to transactions")]
    InvalidRoundIndex(u64),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
