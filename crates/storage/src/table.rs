//! Tables: a hash index over a slot arena of records
//!
//! The index maps a key to a slot; the slot number is the record's location
//! handle and is what remote partitions hand back as a hint. Hints can go
//! stale after a raw delete, so [`Table::record_at`] re-checks the key.
//!
//! Transactional deletes only install tombstones. Index entries and slots
//! are reclaimed by the raw loader path ([`Table::remove`]) and, for
//! records created for a write that never committed, by
//! [`Table::remove_vacant`]. A caller that locked a record it looked up
//! earlier checks [`Table::is_current`] before writing to it.

use crate::backend::{new_index, IndexBackend};
use crate::record::Record;
use epochkv_core::{BackendKind, Error, Key, Result, TableConfig, TableId};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug)]
struct TableInner {
    index: Box<dyn IndexBackend>,
    records: Vec<Option<Arc<Record>>>,
    free: Vec<usize>,
}

/// One table of one partition
#[derive(Debug)]
pub struct Table {
    id: TableId,
    capacity: usize,
    inner: RwLock<TableInner>,
}

impl Table {
    /// Create an empty table
    pub fn new(config: TableConfig, backend: BackendKind) -> Self {
        Self {
            id: config.id,
            capacity: config.capacity,
            inner: RwLock::new(TableInner {
                index: new_index(backend, config.capacity),
                records: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Table id
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of indexed records, tombstoned ones included
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Whether the table holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a record and its slot
    pub fn get(&self, key: Key) -> Option<(usize, Arc<Record>)> {
        let inner = self.inner.read();
        let slot = inner.index.get(key)?;
        let record = inner.records.get(slot)?.as_ref()?;
        Some((slot, Arc::clone(record)))
    }

    /// Record at `slot` if it still holds `key`
    pub fn record_at(&self, slot: usize, key: Key) -> Option<Arc<Record>> {
        let inner = self.inner.read();
        inner
            .records
            .get(slot)?
            .as_ref()
            .filter(|r| r.key() == key)
            .map(Arc::clone)
    }

    /// Look up a record, creating an empty one if absent
    ///
    /// # Errors
    ///
    /// [`Error::StoreFull`] if the arena or the index has no room. Nothing
    /// is left behind on failure.
    pub fn get_or_insert(&self, key: Key) -> Result<(usize, Arc<Record>)> {
        if let Some(found) = self.get(key) {
            return Ok(found);
        }

        let mut inner = self.inner.write();
        if let Some(slot) = inner.index.get(key) {
            if let Some(Some(record)) = inner.records.get(slot) {
                return Ok((slot, Arc::clone(record)));
            }
        }

        let full = Error::StoreFull {
            table: self.id,
            key,
        };
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None if inner.records.len() < self.capacity => {
                inner.records.push(None);
                inner.records.len() - 1
            }
            None => return Err(full),
        };

        if inner.index.insert(key, slot).is_err() {
            inner.free.push(slot);
            tracing::debug!(table = %self.id, key, "index full");
            return Err(full);
        }
        let record = Arc::new(Record::new(key));
        inner.records[slot] = Some(Arc::clone(&record));
        Ok((slot, record))
    }

    /// Physically remove a record
    ///
    /// Not safe to mix with running transactions.
    pub fn remove(&self, key: Key) -> bool {
        let mut inner = self.inner.write();
        match inner.index.delete(key) {
            Some(slot) => {
                inner.records[slot] = None;
                inner.free.push(slot);
                true
            }
            None => false,
        }
    }

    /// Drop `record` from the table if it is still indexed under `key` and
    /// has no versions
    ///
    /// The caller must hold the record's exclusive lock so nothing installs
    /// into it meanwhile.
    pub fn remove_vacant(&self, key: Key, record: &Arc<Record>) -> bool {
        let mut inner = self.inner.write();
        let Some(slot) = inner.index.get(key) else {
            return false;
        };
        let indexed = matches!(inner.records.get(slot), Some(Some(r)) if Arc::ptr_eq(r, record));
        if !indexed || !record.is_vacant() {
            return false;
        }
        inner.index.delete(key);
        inner.records[slot] = None;
        inner.free.push(slot);
        tracing::trace!(table = %self.id, key, slot, "vacant record removed");
        true
    }

    /// Whether `record` is the one indexed under `key`
    pub fn is_current(&self, key: Key, record: &Arc<Record>) -> bool {
        self.get(key).is_some_and(|(_, r)| Arc::ptr_eq(&r, record))
    }

    /// All keys in ascending order
    pub fn sorted_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .inner
            .read()
            .index
            .entries()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Prune versions below `horizon`; returns versions removed
    pub fn collect_garbage(&self, horizon: u64) -> usize {
        let records: Vec<Arc<Record>> = self.inner.read().records.iter().flatten().cloned().collect();
        records.iter().map(|r| r.prune(horizon)).sum()
    }
}
