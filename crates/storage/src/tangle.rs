//! Typed access to transactions, rounds and state diffs.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use quick_cache::sync::Cache;
use tangle_metrics::MetricsRecorder;
use tangle_types::{Hash, Round, StateDiff, Transaction, TransactionMetadata};
use tracing::trace;

use crate::keys::{decode_round_key, pair_child, pair_key, round_key};
use crate::{Column, Direction, KvStore, StorageError, WriteBatch};

/// Transactions kept decoded in memory by default.
pub const DEFAULT_TRANSACTION_CACHE_SIZE: usize = 50_000;

/// The transaction DAG and its round bookkeeping on top of a [`KvStore`].
///
/// Cheap to share behind an `Arc`. Metadata updates are serialized through
/// one lock so read-modify-write sequences never interleave.
pub struct Tangle {
    store: Arc<dyn KvStore>,
    transactions: Cache<Hash, Transaction>,
    metadata_lock: Mutex<()>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl std::fmt::Debug for Tangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tangle")
            .field("cached_transactions", &self.transactions.len())
            .finish_non_exhaustive()
    }
}

fn corrupt(column: Column, reason: impl ToString) -> StorageError {
    StorageError::Corrupt {
        column: column.name(),
        reason: reason.to_string(),
    }
}

impl Tangle {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_metrics(store, tangle_metrics::noop())
    }

    pub fn with_metrics(store: Arc<dyn KvStore>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self::with_cache_capacity(store, metrics, DEFAULT_TRANSACTION_CACHE_SIZE)
    }

    pub fn with_cache_capacity(
        store: Arc<dyn KvStore>,
        metrics: Arc<dyn MetricsRecorder>,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            transactions: Cache::new(capacity.max(1)),
            metadata_lock: Mutex::new(()),
            metrics,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Persist a transaction with fresh metadata and its index entries.
    ///
    /// Returns `false` if the transaction was already stored.
    pub fn store_transaction(
        &self,
        tx: &Transaction,
        arrival_time: u64,
    ) -> Result<bool, StorageError> {
        let hash = tx.hash();
        if self.exists(&hash)? {
            return Ok(false);
        }
        let metadata = TransactionMetadata {
            arrival_time,
            ..Default::default()
        };

        let start = Instant::now();
        let mut batch = WriteBatch::new();
        batch.put(Column::Transaction, hash.as_bytes().to_vec(), tx.as_bytes().to_vec());
        batch.put(Column::Metadata, hash.as_bytes().to_vec(), metadata.to_bytes().to_vec());
        batch.put(Column::Approver, pair_key(&tx.trunk(), &hash).to_vec(), Vec::new());
        batch.put(Column::Approver, pair_key(&tx.branch(), &hash).to_vec(), Vec::new());
        batch.put(Column::Bundle, pair_key(&tx.bundle(), &hash).to_vec(), Vec::new());
        batch.put(Column::Address, pair_key(&tx.address(), &hash).to_vec(), Vec::new());
        self.metrics.record_storage_batch_size(batch.len());
        self.store.write(batch)?;
        self.metrics.record_storage_write(start.elapsed().as_secs_f64());

        self.transactions.insert(hash, tx.clone());
        trace!(hash = %hash, "stored transaction");
        Ok(true)
    }

    pub fn exists(&self, hash: &Hash) -> Result<bool, StorageError> {
        if self.transactions.get(hash).is_some() {
            return Ok(true);
        }
        self.store.contains(Column::Transaction, hash.as_bytes())
    }

    pub fn transaction(&self, hash: &Hash) -> Result<Option<Transaction>, StorageError> {
        if let Some(tx) = self.transactions.get(hash) {
            return Ok(Some(tx));
        }
        let start = Instant::now();
        let Some(bytes) = self.store.get(Column::Transaction, hash.as_bytes())? else {
            return Ok(None);
        };
        self.metrics.record_storage_read(start.elapsed().as_secs_f64());
        let tx = Transaction::from_bytes(&bytes).map_err(|e| corrupt(Column::Transaction, e))?;
        self.transactions.insert(*hash, tx.clone());
        Ok(Some(tx))
    }

    pub fn metadata(&self, hash: &Hash) -> Result<Option<TransactionMetadata>, StorageError> {
        self.store
            .get(Column::Metadata, hash.as_bytes())?
            .map(|bytes| {
                TransactionMetadata::from_bytes(&bytes).map_err(|e| corrupt(Column::Metadata, e))
            })
            .transpose()
    }

    /// Transaction and metadata together, `None` if either is missing.
    pub fn load(
        &self,
        hash: &Hash,
    ) -> Result<Option<(Transaction, TransactionMetadata)>, StorageError> {
        let Some(tx) = self.transaction(hash)? else {
            return Ok(None);
        };
        Ok(self.metadata(hash)?.map(|meta| (tx, meta)))
    }

    /// Read-modify-write a transaction's metadata.
    ///
    /// Returns the updated metadata, or `None` if the transaction is unknown.
    pub fn update_metadata<F>(
        &self,
        hash: &Hash,
        update: F,
    ) -> Result<Option<TransactionMetadata>, StorageError>
    where
        F: FnOnce(&mut TransactionMetadata),
    {
        let _guard = self.metadata_lock.lock();
        let Some(mut metadata) = self.metadata(hash)? else {
            return Ok(None);
        };
        let before = metadata;
        update(&mut metadata);
        if metadata != before {
            self.store
                .put(Column::Metadata, hash.as_bytes(), &metadata.to_bytes())?;
        }
        Ok(Some(metadata))
    }

    fn children(&self, column: Column, parent: &Hash) -> Result<Vec<Hash>, StorageError> {
        Ok(self
            .store
            .scan_prefix(column, parent.as_bytes())?
            .iter()
            .filter_map(|(key, _)| pair_child(key))
            .collect())
    }

    /// Record `child` as an approver of `parent` outside its trunk/branch.
    ///
    /// Milestone bundles reference their parents through Merkle roots, so the
    /// expanded parents are linked explicitly once the milestone validates.
    pub fn add_approver(&self, parent: &Hash, child: &Hash) -> Result<(), StorageError> {
        self.store
            .put(Column::Approver, &pair_key(parent, child), &[])
    }

    /// Transactions referencing `hash` as trunk or branch.
    pub fn approvers(&self, hash: &Hash) -> Result<Vec<Hash>, StorageError> {
        self.children(Column::Approver, hash)
    }

    /// Transactions carrying `bundle` as their bundle hash.
    pub fn bundle_transactions(&self, bundle: &Hash) -> Result<Vec<Hash>, StorageError> {
        self.children(Column::Bundle, bundle)
    }

    /// Transactions issued from `address`.
    pub fn address_transactions(&self, address: &Hash) -> Result<Vec<Hash>, StorageError> {
        self.children(Column::Address, address)
    }

    // ── Rounds ───────────────────────────────────────────────────────

    pub fn put_round(&self, round: &Round) -> Result<(), StorageError> {
        let value = serde_json::to_vec(round).map_err(|e| corrupt(Column::Round, e))?;
        self.store.put(Column::Round, &round_key(round.index), &value)
    }

    pub fn round(&self, index: u64) -> Result<Option<Round>, StorageError> {
        self.store
            .get(Column::Round, &round_key(index))?
            .map(|bytes| decode_round(&bytes))
            .transpose()
    }

    pub fn round_exists(&self, index: u64) -> Result<bool, StorageError> {
        self.store.contains(Column::Round, &round_key(index))
    }

    pub fn delete_round(&self, index: u64) -> Result<(), StorageError> {
        self.store.delete(Column::Round, &round_key(index))
    }

    fn seek_round(&self, from: u64, direction: Direction) -> Result<Option<Round>, StorageError> {
        match self.store.seek(Column::Round, &round_key(from), direction)? {
            Some((key, value)) if decode_round_key(&key).is_some() => decode_round(&value).map(Some),
            _ => Ok(None),
        }
    }

    pub fn first_round(&self) -> Result<Option<Round>, StorageError> {
        self.seek_round(0, Direction::Forward)
    }

    pub fn latest_round(&self) -> Result<Option<Round>, StorageError> {
        self.seek_round(u64::MAX, Direction::Reverse)
    }

    /// Closest stored round after `index`.
    pub fn next_round(&self, index: u64) -> Result<Option<Round>, StorageError> {
        match index.checked_add(1) {
            Some(from) => self.seek_round(from, Direction::Forward),
            None => Ok(None),
        }
    }

    /// Closest stored round before `index`.
    pub fn prev_round(&self, index: u64) -> Result<Option<Round>, StorageError> {
        match index.checked_sub(1) {
            Some(from) => self.seek_round(from, Direction::Reverse),
            None => Ok(None),
        }
    }

    /// Closest stored round after `index` and not past `max_index`.
    pub fn closest_next_round(
        &self,
        index: u64,
        max_index: u64,
    ) -> Result<Option<Round>, StorageError> {
        Ok(self.next_round(index)?.filter(|r| r.index <= max_index))
    }

    /// Closest stored round at or before `index` and after `min_index`.
    pub fn closest_prev_round(
        &self,
        index: u64,
        min_index: u64,
    ) -> Result<Option<Round>, StorageError> {
        Ok(self
            .seek_round(index, Direction::Reverse)?
            .filter(|r| r.index > min_index))
    }

    // ── State diffs ──────────────────────────────────────────────────

    pub fn put_state_diff(&self, diff: &StateDiff) -> Result<(), StorageError> {
        let value = serde_json::to_vec(diff).map_err(|e| corrupt(Column::StateDiff, e))?;
        self.store
            .put(Column::StateDiff, &round_key(diff.index), &value)
    }

    pub fn state_diff(&self, index: u64) -> Result<Option<StateDiff>, StorageError> {
        self.store
            .get(Column::StateDiff, &round_key(index))?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|e| corrupt(Column::StateDiff, e))
            })
            .transpose()
    }

    pub fn delete_state_diff(&self, index: u64) -> Result<(), StorageError> {
        self.store.delete(Column::StateDiff, &round_key(index))
    }
}

fn decode_round(bytes: &[u8]) -> Result<Round, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| corrupt(Column::Round, e))
}
