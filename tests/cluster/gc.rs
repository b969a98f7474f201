//! Version garbage collection and reader pins.

use crate::common::*;
use epochkv::{Cluster, PartitionId};

fn versions(cluster: &Cluster, key: u64) -> usize {
    let partition = cluster.context().partition(PartitionId(0)).unwrap();
    let (_, record) = partition.get(T, key).unwrap().unwrap();
    record.version_count()
}

#[test]
fn test_gc_keeps_versions_pinned_readers_need() {
    let cluster = manual_cluster(1, 2);
    let mut writer = cluster.worker(PartitionId(0), 0).unwrap();
    let mut reader = cluster.worker(PartitionId(0), 1).unwrap();

    let mut write = |n: u64| {
        writer
            .run(false, 0, |txn| txn.add(T, 1, num(n)))
            .unwrap();
        cluster.advance_epoch();
    };

    write(1);
    let mut ro = reader.begin(true).unwrap();
    assert_eq!(as_num(ro.get(T, 1).unwrap()), Some(1));
    write(2);
    write(3);
    assert_eq!(versions(&cluster, 1), 3);

    assert_eq!(cluster.collect_garbage(), 0);
    assert_eq!(versions(&cluster, 1), 3);
    ro.end().unwrap();

    assert_eq!(cluster.collect_garbage(), 2);
    assert_eq!(versions(&cluster, 1), 1);

    let mut ro = reader.begin(true).unwrap();
    assert_eq!(as_num(ro.get(T, 1).unwrap()), Some(3));
}

#[test]
fn test_gc_without_workers_is_noop() {
    let cluster = manual_cluster(1, 1);
    cluster.load(T, 1, num(1)).unwrap();
    assert_eq!(cluster.safe_read_ss(), None);
    assert_eq!(cluster.collect_garbage(), 0);
}
