//! Storage traits and shared types.
//!
//! The consensus core only needs a columnar key/value store with point
//! reads and writes, prefix scans, ordered seeks and atomic batches. This
//! crate defines that contract ([`KvStore`]) and the typed [`Tangle`] facade
//! the rest of the node uses on top of it.
//!
//! Backends:
//! - `tangle-storage-memory` keeps everything in persistent ordered maps
//!   (tests and simulation)
//! - `tangle-storage-rocksdb` maps each [`Column`] to a RocksDB column family
//!   (production)
//!
//! All methods take `&self`; implementations use interior mutability.

#![warn(missing_docs)]

pub mod keys;
mod tangle;

pub use tangle::{Tangle, DEFAULT_TRANSACTION_CACHE_SIZE};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Backend failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored value could not be decoded.
    #[error("Corrupt {column} entry: {reason}")]
    Corrupt {
        /// Column the entry was read from.
        column: &'static str,
        /// Decoder message.
        reason: String,
    },
}

/// Logical partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    /// Transaction hash → serialized transaction.
    Transaction,
    /// Transaction hash → serialized metadata.
    Metadata,
    /// Approvee hash ‖ approver hash → empty.
    Approver,
    /// Bundle hash ‖ transaction hash → empty.
    Bundle,
    /// Address ‖ transaction hash → empty.
    Address,
    /// Big-endian round index → serialized round.
    Round,
    /// Big-endian round index → serialized state diff.
    StateDiff,
}

impl Column {
    /// Every column, in a stable order.
    pub const ALL: [Column; 7] = [
        Column::Transaction,
        Column::Metadata,
        Column::Approver,
        Column::Bundle,
        Column::Address,
        Column::Round,
        Column::StateDiff,
    ];

    /// Backend name of the column.
    pub fn name(self) -> &'static str {
        match self {
            Column::Transaction => "transaction",
            Column::Metadata => "transaction_metadata",
            Column::Approver => "approver",
            Column::Bundle => "bundle",
            Column::Address => "address",
            Column::Round => "round",
            Column::StateDiff => "state_diff",
        }
    }
}

/// Seek direction for [`KvStore::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// First entry with key `>=` the seek key.
    Forward,
    /// Last entry with key `<=` the seek key.
    Reverse,
}

/// One operation of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite.
    Put {
        /// Target column.
        column: Column,
        /// Key.
        key: Vec<u8>,
        /// Value.
        value: Vec<u8>,
    },
    /// Remove if present.
    Delete {
        /// Target column.
        column: Column,
        /// Key.
        key: Vec<u8>,
    },
}

/// A set of writes applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queue a delete.
    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            column,
            key: key.into(),
        });
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// A key/value pair returned by scans.
pub type Entry = (Vec<u8>, Vec<u8>);

/// The storage contract the consensus core requires.
///
/// Single-key operations are atomic. [`KvStore::write`] applies a whole
/// batch atomically.
pub trait KvStore: Send + Sync {
    /// Read one value.
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write one value.
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Delete one value. Missing keys are not an error.
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<Entry>, StorageError>;

    /// The closest entry to `key` in `direction`, inclusive.
    fn seek(
        &self,
        column: Column,
        key: &[u8],
        direction: Direction,
    ) -> Result<Option<Entry>, StorageError>;

    /// Apply a batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// Whether a key is present.
    fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(column, key)?.is_some())
    }
}
