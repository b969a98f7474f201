//! Non-transactional access for bulk loading and inspection
//!
//! A [`RawTx`] writes straight into a partition without locks, leases or
//! snapshots. Loaded versions carry stamp 0, so every snapshot sees them.
//! It must not run concurrently with transactions on the same partition.

use crate::partition::Partition;
use crate::record::{Value, Version};
use epochkv_core::{Key, Result, TableId};
use std::time::Duration;

const REGION_TIMEOUT: Duration = Duration::from_millis(100);

/// Direct access to one partition's tables
pub struct RawTx<'a> {
    partition: &'a Partition,
}

impl<'a> RawTx<'a> {
    /// Open raw access to `partition`
    pub fn new(partition: &'a Partition) -> Self {
        Self { partition }
    }

    /// Insert or overwrite a value
    pub fn put(&self, table: TableId, key: Key, value: impl Into<Value>) -> Result<()> {
        let (_, record) = self.partition.table(table)?.get_or_insert(key)?;
        let value = value.into();
        self.partition
            .region()
            .execute(REGION_TIMEOUT, || {
                record.install(Version {
                    stamp: 0,
                    seq: 0,
                    value: Some(value),
                })
            })
            .map_err(|_| epochkv_core::Error::RegionAborted)
    }

    /// Latest value, ignoring tombstones
    pub fn get(&self, table: TableId, key: Key) -> Result<Option<Value>> {
        Ok(self
            .partition
            .table(table)?
            .get(key)
            .and_then(|(_, r)| r.read_latest())
            .and_then(|v| v.value))
    }

    /// Physically remove a record
    pub fn delete(&self, table: TableId, key: Key) -> Result<bool> {
        Ok(self.partition.table(table)?.remove(key))
    }

    /// Live `(key, value)` pairs in key order
    pub fn scan(&self, table: TableId) -> Result<Vec<(Key, Value)>> {
        let t = self.partition.table(table)?;
        Ok(t.sorted_keys()
            .into_iter()
            .filter_map(|k| {
                let (_, record) = t.get(k)?;
                record.read_latest()?.value.map(|v| (k, v))
            })
            .collect())
    }
}
