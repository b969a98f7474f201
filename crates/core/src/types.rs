//! Identifier types
//!
//! - [`TableId`]: one logical table among those declared at startup
//! - [`RecordKey`]: `(table, key)` composite, totally ordered table-first
//! - [`PartitionId`] / [`NodeId`] / [`Address`]: messaging endpoints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Record key within a table
pub type Key = u64;

/// Index of a worker thread in the snapshot manager's watermark table
pub type ThreadId = usize;

/// Identifier of a logical table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identifier of a partition (one node's shard of the keyspace)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Position of this partition in dense per-partition vectors
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identifier of an endpoint within a partition
///
/// Node 0 is the partition's request server; workers use 1..
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

/// Messaging endpoint address: `(partition, node)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    /// Owning partition
    pub partition: PartitionId,
    /// Endpoint within the partition
    pub node: NodeId,
}

impl Address {
    /// Create an address
    pub fn new(partition: PartitionId, node: NodeId) -> Self {
        Self { partition, node }
    }

    /// Address of a partition's request server
    pub fn server(partition: PartitionId) -> Self {
        Self::new(partition, NodeId(0))
    }

    /// Address of worker `index` hosted by `partition`
    pub fn worker(partition: PartitionId, index: u32) -> Self {
        Self::new(partition, NodeId(index + 1))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/n{}", self.partition, self.node.0)
    }
}

/// Composite identity of a record: `(table, key)`
///
/// The derived ordering compares the table first and then the key. This is
/// the canonical order in which fallback locking acquires write locks, so
/// the field order must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// Table the record lives in
    pub table: TableId,
    /// Key within the table
    pub key: Key,
}

impl RecordKey {
    /// Create a record key
    pub fn new(table: TableId, key: Key) -> Self {
        Self { table, key }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.key)
    }
}
