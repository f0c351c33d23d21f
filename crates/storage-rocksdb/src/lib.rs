//! # RocksDB Storage
//!
//! Production [`KvStore`](tangle_storage::KvStore) backed by RocksDB, one
//! column family per [`Column`](tangle_storage::Column).
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking` if needed to avoid blocking the runtime.

mod storage;

pub use storage::{CompressionType, RocksDbConfig, RocksDbStore};
