//! # RocksDB Storage
//!
//! Every [`Column`] maps to a column family of the same name. Prefix scans
//! and seeks go through raw iterators; batches become a single RocksDB
//! `WriteBatch` so they land atomically.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use serde::Deserialize;
use tangle_storage::keys::next_prefix;
use tangle_storage::{BatchOp, Column, Direction, Entry, KvStore, StorageError, WriteBatch};
use tracing::{debug, instrument};

fn db_error(e: rocksdb::Error) -> StorageError {
    StorageError::DatabaseError(e.to_string())
}

/// RocksDB-based storage for production use.
///
/// Features:
/// - Column families for logical separation
/// - LZ4 compression for disk efficiency
/// - Block cache for read performance
/// - Bloom filters for key existence checks
pub struct RocksDbStore {
    db: Arc<DB>,
}

impl std::fmt::Debug for RocksDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDbStore {
    /// Open or create a database at `path` with one column family per [`Column`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Performance tuning
        opts.set_max_background_jobs(config.max_background_jobs);
        if config.bytes_per_sync > 0 {
            opts.set_bytes_per_sync(config.bytes_per_sync as u64);
        }
        opts.set_keep_log_file_num(config.keep_log_file_num);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(config.compression.to_rocksdb());

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors: Vec<_> = std::iter::once("default")
            .chain(Column::ALL.iter().map(|c| c.name()))
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(config.compression.to_rocksdb());
                ColumnFamilyDescriptor::new(name, cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors).map_err(db_error)?;
        debug!("opened rocksdb store");
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, column: Column) -> Result<&ColumnFamily, StorageError> {
        self.db.cf_handle(column.name()).ok_or_else(|| {
            StorageError::DatabaseError(format!("column family {} missing", column.name()))
        })
    }

    /// Flush memtables of every column to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        for column in Column::ALL {
            self.db.flush_cf(self.cf(column)?).map_err(db_error)?;
        }
        Ok(())
    }
}

impl KvStore for RocksDbStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db.get_cf(self.cf(column)?, key).map_err(db_error)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.put_cf(self.cf(column)?, key, value).map_err(db_error)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError> {
        self.db.delete_cf(self.cf(column)?, key).map_err(db_error)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<Entry>, StorageError> {
        let end = next_prefix(prefix);
        let mut iter = self.db.raw_iterator_cf(self.cf(column)?);
        iter.seek(prefix);

        let mut entries = Vec::new();
        while iter.valid() {
            let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                break;
            };
            if end.as_deref().is_some_and(|end| key >= end) || !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
            iter.next();
        }
        iter.status().map_err(db_error)?;
        Ok(entries)
    }

    fn seek(
        &self,
        column: Column,
        key: &[u8],
        direction: Direction,
    ) -> Result<Option<Entry>, StorageError> {
        let mut iter = self.db.raw_iterator_cf(self.cf(column)?);
        match direction {
            Direction::Forward => iter.seek(key),
            Direction::Reverse => iter.seek_for_prev(key),
        }
        if !iter.valid() {
            iter.status().map_err(db_error)?;
            return Ok(None);
        }
        Ok(iter
            .key()
            .zip(iter.value())
            .map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { column, key, value } => {
                    rocks_batch.put_cf(self.cf(column)?, key, value);
                }
                BatchOp::Delete { column, key } => {
                    rocks_batch.delete_cf(self.cf(column)?, key);
                }
            }
        }
        self.db.write(rocks_batch).map_err(db_error)
    }
}

/// Compression type for RocksDB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Snappy,
    Zlib,
    #[default]
    Lz4,
    Lz4hc,
    Zstd,
}

impl CompressionType {
    fn to_rocksdb(self) -> rocksdb::DBCompressionType {
        match self {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Zlib => rocksdb::DBCompressionType::Zlib,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Lz4hc => rocksdb::DBCompressionType::Lz4hc,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        }
    }
}

/// Configuration for RocksDB storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    /// Maximum number of background jobs
    pub max_background_jobs: i32,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
    /// Maximum number of write buffers
    pub max_write_buffer_number: i32,
    /// Block cache size in bytes (None to disable)
    pub block_cache_size: Option<usize>,
    /// Compression type
    pub compression: CompressionType,
    /// Bloom filter bits per key (0 to disable)
    pub bloom_filter_bits: f64,
    /// Bytes per sync (0 to disable)
    pub bytes_per_sync: usize,
    /// Number of log files to keep
    pub keep_log_file_num: usize,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 4,
            write_buffer_size: 128 * 1024 * 1024, // 128MB
            max_write_buffer_number: 3,
            block_cache_size: Some(512 * 1024 * 1024), // 512MB
            compression: CompressionType::Lz4,
            bloom_filter_bits: 10.0,
            bytes_per_sync: 1024 * 1024, // 1MB
            keep_log_file_num: 10,
        }
    }
}
