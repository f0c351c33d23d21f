//! # Memory Store
//!
//! Each [`Column`] lives in its own `im::OrdMap`, so ordered seeks and
//! prefix scans use `range()` for O(log n + k) lookups and cloning the
//! whole store only bumps reference counts.

use std::sync::Arc;

use im::OrdMap;
use parking_lot::RwLock;
use tangle_storage::keys::next_prefix;
use tangle_storage::{BatchOp, Column, Direction, Entry, KvStore, StorageError, WriteBatch};

type Map = OrdMap<Vec<u8>, Vec<u8>>;

#[derive(Clone, Default)]
struct Columns {
    maps: [Map; Column::ALL.len()],
}

impl Columns {
    fn map(&self, column: Column) -> &Map {
        &self.maps[column as usize]
    }

    fn map_mut(&mut self, column: Column) -> &mut Map {
        &mut self.maps[column as usize]
    }

    fn get(&self, column: Column, key: &[u8]) -> Option<Vec<u8>> {
        self.map(column).get(key).cloned()
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Vec<Entry> {
        let map = self.map(column);
        let start = prefix.to_vec();
        let range: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = match next_prefix(prefix) {
            Some(end) => Box::new(map.range(start..end)),
            None => Box::new(map.range(start..)),
        };
        range.map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn seek(&self, column: Column, key: &[u8], direction: Direction) -> Option<Entry> {
        let map = self.map(column);
        let key = key.to_vec();
        let found = match direction {
            Direction::Forward => map.range(key..).next(),
            Direction::Reverse => map.range(..=key).next_back(),
        };
        found.map(|(k, v)| (k.clone(), v.clone()))
    }

    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Put { column, key, value } => {
                self.map_mut(column).insert(key, value);
            }
            BatchOp::Delete { column, key } => {
                self.map_mut(column).remove(&key);
            }
        }
    }
}

/// In-memory [`KvStore`].
///
/// All methods take `&self`; the columns sit behind one `RwLock` so a
/// [`WriteBatch`] becomes visible all at once.
#[derive(Clone, Default)]
pub struct MemoryStore {
    columns: Arc<RwLock<Columns>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all columns.
    pub fn len(&self) -> usize {
        self.columns.read().maps.iter().map(OrdMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries in one column.
    pub fn column_len(&self, column: Column) -> usize {
        self.columns.read().map(column).len()
    }

    /// An independent store starting from the current contents.
    ///
    /// Writes to either side are invisible to the other.
    pub fn fork(&self) -> Self {
        let columns = self.columns.read().clone();
        Self {
            columns: Arc::new(RwLock::new(columns)),
        }
    }

    /// A read-only view of the current contents.
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            columns: self.columns.read().clone(),
        }
    }
}

impl KvStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.columns.read().get(column, key))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.columns
            .write()
            .map_mut(column)
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StorageError> {
        self.columns.write().map_mut(column).remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<Entry>, StorageError> {
        Ok(self.columns.read().scan_prefix(column, prefix))
    }

    fn seek(
        &self,
        column: Column,
        key: &[u8],
        direction: Direction,
    ) -> Result<Option<Entry>, StorageError> {
        Ok(self.columns.read().seek(column, key, direction))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut columns = self.columns.write();
        for op in batch.into_ops() {
            columns.apply(op);
        }
        Ok(())
    }
}

/// Point-in-time view of a [`MemoryStore`].
///
/// Holds a structurally-shared copy of the columns taken at snapshot time.
pub struct MemorySnapshot {
    columns: Columns,
}

impl MemorySnapshot {
    pub fn get(&self, column: Column, key: &[u8]) -> Option<Vec<u8>> {
        self.columns.get(column, key)
    }

    pub fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Vec<Entry> {
        self.columns.scan_prefix(column, prefix)
    }

    pub fn seek(&self, column: Column, key: &[u8], direction: Direction) -> Option<Entry> {
        self.columns.seek(column, key, direction)
    }
}
