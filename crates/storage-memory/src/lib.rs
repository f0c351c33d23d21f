//! # In-Memory Storage
//!
//! [`KvStore`](tangle_storage::KvStore) backed by one `im::OrdMap` per
//! column. Clones share structure, so [`MemoryStore::fork`] and
//! [`MemoryStore::snapshot`] are O(1) and tests can branch a populated
//! tangle cheaply.

mod storage;

pub use storage::{MemorySnapshot, MemoryStore};
