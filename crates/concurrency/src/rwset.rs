//! Read/write set
//!
//! Entries live in an arena owned by the transaction and are found through
//! a map keyed by [`RecordKey`]. A key has at most one entry: writing a key
//! that was read upgrades the entry in place.
//!
//! Entries are bucketed the way commit consumes them:
//! - local reads and remote reads, re-validated against their leases
//! - read-only reads, taken at the snapshot and never re-validated
//! - writes, locked and written back at commit

use epochkv_core::{PartitionId, RecordKey};
use epochkv_storage::{Record, Value};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Which commit-time bucket an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Leased read of a local record
    LocalRead,
    /// Leased read of a remote record
    RemoteRead,
    /// Snapshot read in a read-only transaction
    ReadOnly,
    /// Pending write or delete
    Write,
}

/// One accessed record
#[derive(Debug, Clone)]
pub struct RwItem {
    /// Table and key
    pub key: RecordKey,
    /// Owning partition
    pub pid: PartitionId,
    /// Location handle: the record's slot on its partition
    pub slot: Option<u64>,
    /// Resolved record, for local entries
    pub record: Option<Arc<Record>>,
    /// Entry belongs to a read-only transaction
    pub ro: bool,
    /// Commit-time bucket
    pub bucket: Bucket,
    /// Value read, or value to write (`None`: absent / delete)
    pub value: Option<Value>,
    /// Expiry of the read lease held on the record, kept when the entry
    /// becomes a write until the lock replaces it
    pub lease_end: Option<u64>,
    /// A lock request was issued for this entry
    pub lock_attempted: bool,
    /// The lock is held
    pub locked: bool,
}

impl RwItem {
    /// New entry
    pub fn new(key: RecordKey, pid: PartitionId, bucket: Bucket) -> Self {
        Self {
            key,
            pid,
            slot: None,
            record: None,
            ro: bucket == Bucket::ReadOnly,
            bucket,
            value: None,
            lease_end: None,
            lock_attempted: false,
            locked: false,
        }
    }

    /// Whether this entry is a write
    pub fn is_write(&self) -> bool {
        self.bucket == Bucket::Write
    }
}

/// Arena of entries indexed by record key
#[derive(Debug, Default)]
pub struct RwSet {
    items: Vec<RwItem>,
    index: FxHashMap<RecordKey, usize>,
}

impl RwSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `key`
    pub fn get(&self, key: &RecordKey) -> Option<&RwItem> {
        self.index.get(key).map(|&i| &self.items[i])
    }

    /// Mutable entry for `key`
    pub fn get_mut(&mut self, key: &RecordKey) -> Option<&mut RwItem> {
        self.index.get(key).map(|&i| &mut self.items[i])
    }

    /// Add an entry; an existing entry for the same key is returned instead
    pub fn insert(&mut self, item: RwItem) -> &mut RwItem {
        let next = self.items.len();
        let i = *self.index.entry(item.key).or_insert(next);
        if i == next {
            self.items.push(item);
        }
        &mut self.items[i]
    }

    /// Register a write of `value` (`None` deletes), upgrading a read entry
    ///
    /// An upgraded entry keeps its lease so the lock can take it over.
    pub fn upsert_write(&mut self, key: RecordKey, pid: PartitionId, value: Option<Value>) -> &mut RwItem {
        let item = self.insert(RwItem::new(key, pid, Bucket::Write));
        item.bucket = Bucket::Write;
        item.value = value;
        item
    }

    /// Entries in `bucket`
    pub fn bucket(&self, bucket: Bucket) -> impl Iterator<Item = &RwItem> {
        self.items.iter().filter(move |i| i.bucket == bucket)
    }

    /// Write entries, local partition first, each group in insertion order
    pub fn write_order(&self, local: PartitionId) -> Vec<usize> {
        let writes = || {
            self.items
                .iter()
                .enumerate()
                .filter(|(_, i)| i.is_write())
        };
        writes()
            .filter(|(_, i)| i.pid == local)
            .chain(writes().filter(|(_, i)| i.pid != local))
            .map(|(n, _)| n)
            .collect()
    }

    /// Write entries sorted by `(table, key)`
    pub fn canonical_write_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.items.len())
            .filter(|&n| self.items[n].is_write())
            .collect();
        order.sort_by_key(|&n| self.items[n].key);
        order
    }

    /// Entry by arena position
    pub fn at(&self, n: usize) -> &RwItem {
        &self.items[n]
    }

    /// Mutable entry by arena position
    pub fn at_mut(&mut self, n: usize) -> &mut RwItem {
        &mut self.items[n]
    }

    /// Positions of entries an abort must release: attempted locks and
    /// local writes holding a reserved record
    pub fn to_release(&self) -> Vec<usize> {
        (0..self.items.len())
            .filter(|&n| {
                let item = &self.items[n];
                item.lock_attempted || (item.is_write() && item.record.is_some())
            })
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of writes
    pub fn write_count(&self) -> usize {
        self.bucket(Bucket::Write).count()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}
