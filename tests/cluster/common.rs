//! Shared helpers for the cluster suite.

#![allow(dead_code)]

use epochkv::{BackendKind, Cluster, Key, PartitionId, TableId, Value};

/// The default table.
pub const T: TableId = TableId(0);

/// Cluster whose epochs advance only through `advance_epoch`.
pub fn manual_cluster(partitions: u32, workers: u32) -> Cluster {
    Cluster::builder()
        .partitions(partitions)
        .workers_per_partition(workers)
        .table(T, 1024)
        .manual_epochs()
        .build()
        .expect("failed to start cluster")
}

/// Cluster with the epoch ticker running.
pub fn ticking_cluster(partitions: u32, workers: u32) -> Cluster {
    Cluster::builder()
        .partitions(partitions)
        .workers_per_partition(workers)
        .table(T, 1024)
        .build()
        .expect("failed to start cluster")
}

/// Manual-epoch cluster with a given backend and table capacity.
pub fn cluster_with(backend: BackendKind, partitions: u32, capacity: usize) -> Cluster {
    Cluster::builder()
        .partitions(partitions)
        .workers_per_partition(2)
        .backend(backend)
        .table(T, capacity)
        .manual_epochs()
        .build()
        .expect("failed to start cluster")
}

/// The `n`th key owned by `pid`.
pub fn key_on(cluster: &Cluster, pid: PartitionId, n: usize) -> Key {
    (0..)
        .filter(|&k| cluster.partition_of(k) == pid)
        .nth(n)
        .expect("partition owns no keys")
}

pub fn bytes(v: Option<Value>) -> Option<Vec<u8>> {
    v.map(|v| v.to_vec())
}

pub fn num(n: u64) -> Vec<u8> {
    n.to_le_bytes().to_vec()
}

pub fn as_num(v: Option<Value>) -> Option<u64> {
    v.and_then(|v| v.as_ref().try_into().ok()).map(u64::from_le_bytes)
}

pub fn vec_num(v: Option<Vec<u8>>) -> u64 {
    v.and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}
