//! Snapshot cursor over one table of the worker's partition

use crate::manager::TransactionManager;
use epochkv_core::{Key, Result, TableId};
use epochkv_storage::{Partition, Value};
use std::sync::Arc;

/// Bidirectional cursor over the committed contents of a table at a fixed
/// snapshot
///
/// The key set is captured when the cursor is created; values are read
/// lazily at the snapshot as the cursor moves, so keys whose visible
/// version is a tombstone or newer than the snapshot are skipped. Pending
/// writes of the owning transaction are not included. A record still
/// locked by a finished transaction is resolved before it is read.
///
/// As an [`Iterator`] it yields `(key, value)` pairs in ascending key
/// order, starting from the first key unless the cursor was positioned
/// first. Once exhausted it stays exhausted; take a new cursor to re-scan.
#[derive(Debug)]
pub struct TxIterator {
    partition: Arc<Partition>,
    manager: Arc<TransactionManager>,
    table: TableId,
    snapshot: u64,
    keys: Vec<Key>,
    pos: Option<usize>,
    current: Option<(Key, Value)>,
    started: bool,
}

impl TxIterator {
    pub(crate) fn new(
        partition: Arc<Partition>,
        manager: Arc<TransactionManager>,
        table: TableId,
        snapshot: u64,
    ) -> Result<Self> {
        let keys = partition.table(table)?.sorted_keys();
        Ok(Self {
            partition,
            manager,
            table,
            snapshot,
            keys,
            pos: None,
            current: None,
            started: false,
        })
    }

    /// Snapshot the cursor reads at
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// Whether the cursor is on an entry
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Key under the cursor
    pub fn key(&self) -> Option<Key> {
        self.current.as_ref().map(|(k, _)| *k)
    }

    /// Value under the cursor
    pub fn value(&self) -> Option<&Value> {
        self.current.as_ref().map(|(_, v)| v)
    }

    /// Step to the next visible key; no-op when not valid
    pub fn move_next(&mut self) {
        if let Some(i) = self.pos {
            self.settle(Some(i + 1), true);
        }
    }

    /// Step to the previous visible key; no-op when not valid
    pub fn move_prev(&mut self) {
        if let Some(i) = self.pos {
            self.settle(i.checked_sub(1), false);
        }
    }

    /// Position at the first visible key `>= key`
    pub fn seek(&mut self, key: Key) {
        let i = self.keys.partition_point(|&k| k < key);
        self.settle(Some(i), true);
    }

    /// Position at the smallest visible key
    pub fn seek_to_first(&mut self) {
        self.settle(Some(0), true);
    }

    /// Position at the largest visible key
    pub fn seek_to_last(&mut self) {
        self.settle(self.keys.len().checked_sub(1), false);
    }

    fn visible(&self, key: Key) -> Option<Value> {
        let table = self.partition.table(self.table).ok()?;
        let (_, record) = table.get(key)?;
        self.manager.resolve(table, key, &record);
        record.read_at(self.snapshot)?.value
    }

    fn settle(&mut self, mut at: Option<usize>, forward: bool) {
        self.started = true;
        while let Some(i) = at.filter(|&i| i < self.keys.len()) {
            let key = self.keys[i];
            if let Some(value) = self.visible(key) {
                self.pos = Some(i);
                self.current = Some((key, value));
                return;
            }
            at = if forward { Some(i + 1) } else { i.checked_sub(1) };
        }
        self.pos = None;
        self.current = None;
    }
}

impl Iterator for TxIterator {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<Self::Item> {
        if self.started {
            self.move_next();
        } else {
            self.seek_to_first();
        }
        self.current.clone()
    }
}
