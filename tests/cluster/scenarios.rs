//! End-to-end scenarios: visibility, racing writers, snapshot isolation.

use crate::common::*;
use epochkv::{EngineError, PartitionId};
use std::sync::Barrier;
use std::thread;

#[test]
fn test_committed_write_visible_to_fresh_read_only_transaction() {
    let cluster = manual_cluster(2, 1);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    let mut txn = w.begin(false).unwrap();
    txn.add(T, 5, b"A".to_vec()).unwrap();
    let info = txn.end().unwrap();
    assert_eq!(info.writes, 1);

    cluster.advance_epoch();
    let mut ro = w.begin(true).unwrap();
    assert!(ro.snapshot() >= info.commit_ss);
    assert_eq!(bytes(ro.get(T, 5).unwrap()), Some(b"A".to_vec()));
    ro.end().unwrap();
}

#[test]
fn test_wait_visible_with_ticker() {
    let cluster = ticking_cluster(2, 1);
    let mut w = cluster.worker(PartitionId(1), 0).unwrap();

    for key in [4u64, 5] {
        let mut txn = w.begin(false).unwrap();
        txn.add(T, key, b"A".to_vec()).unwrap();
        let info = txn.end().unwrap();
        w.wait_visible(&info);

        let mut ro = w.begin(true).unwrap();
        assert_eq!(bytes(ro.get(T, key).unwrap()), Some(b"A".to_vec()));
    }
}

#[test]
fn test_racing_writers_exactly_one_commits() {
    for round in 0..10u64 {
        let cluster = manual_cluster(2, 1);
        let workers = cluster.workers().unwrap();
        let barrier = Barrier::new(2);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = workers
                .into_iter()
                .enumerate()
                .map(|(i, mut w)| {
                    let barrier = &barrier;
                    s.spawn(move || {
                        let mut txn = w.begin(false).unwrap();
                        txn.add(T, 5, vec![i as u8]).unwrap();
                        barrier.wait();
                        txn.end().map(|_| i as u8)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<u8> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(winners.len(), 1, "round {}: {:?}", round, results);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(loser.is_contention(), "round {}: {}", round, loser);

        cluster.advance_epoch();
        let mut w = cluster.worker(PartitionId(0), 0).unwrap();
        let mut ro = w.begin(true).unwrap();
        assert_eq!(bytes(ro.get(T, 5).unwrap()), Some(vec![winners[0]]));
    }
}

#[test]
fn test_read_only_keeps_its_snapshot() {
    let cluster = manual_cluster(2, 1);
    cluster.load(T, 7, b"old".to_vec()).unwrap();
    cluster.advance_epoch();

    let mut reader = cluster.worker(PartitionId(0), 0).unwrap();
    let mut writer = cluster.worker(PartitionId(1), 0).unwrap();

    let mut ro = reader.begin(true).unwrap();
    let snapshot = ro.snapshot();

    let mut txn = writer.begin(false).unwrap();
    txn.add(T, 7, b"new".to_vec()).unwrap();
    let info = txn.end().unwrap();
    assert!(info.commit_ss > snapshot);
    cluster.advance_epoch();
    cluster.advance_epoch();

    assert_eq!(bytes(ro.get(T, 7).unwrap()), Some(b"old".to_vec()));
    ro.end().unwrap();

    let mut ro = reader.begin(true).unwrap();
    assert_eq!(bytes(ro.get(T, 7).unwrap()), Some(b"new".to_vec()));
}

#[test]
fn test_multi_partition_commit_is_atomic_for_readers() {
    let cluster = manual_cluster(2, 1);
    let a = key_on(&cluster, PartitionId(0), 0);
    let b = key_on(&cluster, PartitionId(1), 0);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    let mut r = cluster.worker(PartitionId(1), 0).unwrap();

    let mut txn = w.begin(false).unwrap();
    txn.add(T, a, num(1)).unwrap();
    txn.add(T, b, num(1)).unwrap();

    // Before commit and before the epoch moves, nothing is visible
    let mut ro = r.begin(true).unwrap();
    assert_eq!(ro.get(T, a).unwrap(), None);
    assert_eq!(ro.get(T, b).unwrap(), None);
    ro.end().unwrap();

    txn.end().unwrap();
    cluster.advance_epoch();

    let mut ro = r.begin(true).unwrap();
    assert_eq!(as_num(ro.get(T, a).unwrap()), Some(1));
    assert_eq!(as_num(ro.get(T, b).unwrap()), Some(1));
}

#[test]
fn test_failed_commit_leaves_nothing_visible() {
    let cluster = manual_cluster(2, 2);
    let a = key_on(&cluster, PartitionId(0), 0);
    let b = key_on(&cluster, PartitionId(1), 0);
    let mut w1 = cluster.worker(PartitionId(0), 0).unwrap();
    let mut w2 = cluster.worker(PartitionId(1), 0).unwrap();

    let mut loser = w2.begin(false).unwrap();
    loser.add(T, a, num(2)).unwrap();
    loser.add(T, b, num(2)).unwrap();

    let mut winner = w1.begin(false).unwrap();
    winner.add(T, b, num(1)).unwrap();
    winner.end().unwrap();

    let err = loser.end().unwrap_err();
    assert!(matches!(err, EngineError::WriteConflict { .. }), "{}", err);

    cluster.advance_epoch();
    let mut ro = w1.begin(true).unwrap();
    assert_eq!(ro.get(T, a).unwrap(), None);
    assert_eq!(as_num(ro.get(T, b).unwrap()), Some(1));
    ro.end().unwrap();

    let metrics = cluster.metrics();
    assert_eq!(metrics.aborted, 1);
    assert_eq!(metrics.active(), 0);
}
