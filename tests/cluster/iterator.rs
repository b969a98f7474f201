//! Transaction iterators over the worker's own partition.

use crate::common::*;
use epochkv::{Key, PartitionId};

#[test]
fn test_read_only_iterator_sees_snapshot_in_key_order() {
    let cluster = manual_cluster(2, 1);
    let mut keys: Vec<Key> = (0..6).map(|n| key_on(&cluster, PartitionId(0), n)).collect();
    for &k in keys.iter().rev() {
        cluster.load(T, k, num(k)).unwrap();
    }
    // Owned by the other partition: never listed
    cluster.load(T, key_on(&cluster, PartitionId(1), 0), num(0)).unwrap();

    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    let mut ro = w.begin(true).unwrap();
    let seen: Vec<(Key, u64)> = ro
        .get_iterator(T)
        .unwrap()
        .map(|(k, v)| (k, as_num(Some(v)).unwrap()))
        .collect();
    assert_eq!(seen, keys.iter().map(|&k| (k, k)).collect::<Vec<_>>());
    ro.end().unwrap();

    // Delete one, add one; an old cursor would not see it, a new one does
    let mut txn = w.begin(false).unwrap();
    txn.delete(T, keys[1]).unwrap();
    let extra = key_on(&cluster, PartitionId(0), 10);
    txn.add(T, extra, num(extra)).unwrap();
    txn.end().unwrap();
    cluster.advance_epoch();

    keys.remove(1);
    keys.push(extra);
    let mut ro = w.begin(true).unwrap();
    let listed: Vec<Key> = ro.get_iterator(T).unwrap().map(|(k, _)| k).collect();
    assert_eq!(listed, keys);
}

#[test]
fn test_cursor_navigation() {
    let cluster = manual_cluster(1, 1);
    for k in [10u64, 20, 30] {
        cluster.load(T, k, num(k)).unwrap();
    }
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    let mut txn = w.begin(false).unwrap();
    let mut it = txn.get_iterator(T).unwrap();

    it.seek_to_last();
    assert_eq!(it.key(), Some(30));
    it.move_prev();
    assert_eq!(it.key(), Some(20));
    it.seek(11);
    assert_eq!(it.key(), Some(20));
    it.seek(31);
    assert!(!it.valid());
    it.seek_to_first();
    assert_eq!(it.value().cloned().map(|v| v.to_vec()), Some(num(10)));
    assert_eq!(it.snapshot(), 0);
    txn.end().unwrap();
}

#[test]
fn test_iterator_requires_known_table_and_active_transaction() {
    let cluster = manual_cluster(1, 1);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    let mut txn = w.begin(true).unwrap();
    assert!(txn.get_iterator(epochkv::TableId(5)).is_err());
    assert!(txn.get_iterator(T).unwrap().next().is_none());
}

#[test]
fn test_read_write_iterator_scans_pinned_snapshot_of_own_partition() {
    let cluster = manual_cluster(2, 1);
    let a = key_on(&cluster, PartitionId(0), 0);
    let b = key_on(&cluster, PartitionId(0), 1);
    cluster.load(T, a, num(1)).unwrap();
    cluster.load(T, key_on(&cluster, PartitionId(1), 0), num(2)).unwrap();
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    let mut txn = w.begin(false).unwrap();
    txn.add(T, b, num(3)).unwrap();
    let first = txn.get_iterator(T).unwrap();
    let pinned = first.snapshot();
    // Pending writes and remote keys are not listed
    assert_eq!(first.map(|(k, _)| k).collect::<Vec<_>>(), vec![a]);

    cluster.advance_epoch();
    let again = txn.get_iterator(T).unwrap();
    assert_eq!(again.snapshot(), pinned);
    txn.end().unwrap();
}
