//! Read leases: validation at commit and interaction with writers.

use crate::common::*;
use epochkv::{EngineError, PartitionId, TransactionStatus};

#[test]
fn test_lease_valid_within_epoch() {
    let cluster = manual_cluster(2, 1);
    cluster.load(T, 1, num(10)).unwrap();
    cluster.load(T, 2, num(20)).unwrap();
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    let mut txn = w.begin(false).unwrap();
    assert_eq!(as_num(txn.get(T, 1).unwrap()), Some(10));
    assert_eq!(as_num(txn.get(T, 2).unwrap()), Some(20));
    txn.add(T, 3, num(30)).unwrap();
    txn.end().unwrap();
}

#[test]
fn test_lapsed_lease_aborts_commit() {
    let cluster = manual_cluster(2, 1);
    cluster.load(T, 1, num(10)).unwrap();
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    for key in [1u64, 0] {
        // Remote read (key 1) then local read (key 0)
        cluster.load(T, key, num(10)).unwrap();
        let mut txn = w.begin(false).unwrap();
        txn.get(T, key).unwrap();
        txn.add(T, 100 + key, num(1)).unwrap();

        cluster.advance_epoch();
        cluster.advance_epoch();
        let err = txn.end().unwrap_err();
        assert!(matches!(err, EngineError::LeaseExpired { .. }), "{}", err);
    }
    assert_eq!(cluster.metrics().aborted, 2);
}

#[test]
fn test_lease_blocks_writer_until_it_lapses() {
    let cluster = manual_cluster(1, 2);
    cluster.load(T, 9, num(1)).unwrap();
    let mut reader = cluster.worker(PartitionId(0), 0).unwrap();
    let mut writer = cluster.worker(PartitionId(0), 1).unwrap();

    let mut r = reader.begin(false).unwrap();
    r.get(T, 9).unwrap();

    let mut txn = writer.begin(false).unwrap();
    txn.add(T, 9, num(2)).unwrap();
    let err = txn.end().unwrap_err();
    assert!(matches!(err, EngineError::LockTimeout { .. }), "{}", err);

    // Once the epoch passes the lease end the writer gets through
    cluster.advance_epoch();
    let mut txn = writer.begin(false).unwrap();
    txn.add(T, 9, num(2)).unwrap();
    txn.end().unwrap();

    // ...and the reader can no longer validate
    r.add(T, 10, num(0)).unwrap();
    assert!(r.end().unwrap_err().is_contention());
}

#[test]
fn test_lock_blocks_lease() {
    let cluster = manual_cluster(2, 1);
    let key = key_on(&cluster, PartitionId(1), 0);
    cluster.load(T, key, num(1)).unwrap();
    let mut holder = cluster.worker(PartitionId(1), 0).unwrap();
    let mut reader = cluster.worker(PartitionId(0), 0).unwrap();

    let mut h = holder.begin(false).unwrap();
    h.get_for_update(T, key).unwrap();

    let mut r = reader.begin(false).unwrap();
    let err = r.get(T, key).unwrap_err();
    assert!(matches!(err, EngineError::LeaseTimeout { .. }), "{}", err);
    assert!(matches!(r.status(), TransactionStatus::Aborted { .. }));
    drop(r);

    h.end().unwrap();
    let mut r = reader.begin(false).unwrap();
    assert_eq!(as_num(r.get(T, key).unwrap()), Some(1));
}

#[test]
fn test_absent_key_reads_without_lease() {
    let cluster = manual_cluster(2, 1);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    let mut txn = w.begin(false).unwrap();
    assert_eq!(txn.get(T, 41).unwrap(), None);
    assert_eq!(txn.get(T, 42).unwrap(), None);
    cluster.advance_epoch();
    cluster.advance_epoch();
    txn.add(T, 43, num(1)).unwrap();
    txn.end().unwrap();
}

#[test]
fn test_read_then_write_commits_under_manual_epochs() {
    let cluster = manual_cluster(2, 1);
    let local = key_on(&cluster, PartitionId(0), 0);
    let remote = key_on(&cluster, PartitionId(1), 0);
    let other = key_on(&cluster, PartitionId(1), 1);
    cluster.load(T, local, num(1)).unwrap();
    cluster.load(T, remote, num(1)).unwrap();
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    for key in [local, remote] {
        let mut txn = w.begin(false).unwrap();
        assert_eq!(as_num(txn.get(T, key).unwrap()), Some(1));
        txn.get(T, other).unwrap();
        txn.add(T, key, num(2)).unwrap();
        txn.end().unwrap();

        let mut txn = w.begin(false).unwrap();
        txn.get(T, key).unwrap();
        txn.update(T, key, |v| Some(num(vec_num(v) + 1))).unwrap();
        txn.end().unwrap();
    }

    cluster.advance_epoch();
    let mut ro = w.begin(true).unwrap();
    assert_eq!(as_num(ro.get(T, local).unwrap()), Some(3));
    assert_eq!(as_num(ro.get(T, remote).unwrap()), Some(3));
}

#[test]
fn test_read_then_write_commits_with_ticking_epochs() {
    let cluster = ticking_cluster(1, 1);
    cluster.load(T, 4, num(0)).unwrap();
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    for _ in 0..5 {
        w.run(false, 10, |txn| {
            let seen = txn.get(T, 4)?;
            txn.add(T, 4, num(as_num(seen).unwrap_or(0) + 1))
        })
        .unwrap();
    }

    let mut txn = w.begin(false).unwrap();
    assert_eq!(vec_num(txn.get_for_update(T, 4).unwrap()), 5);
    txn.abort().unwrap();
}

#[test]
fn test_shared_lease_still_blocks_other_writers() {
    let cluster = manual_cluster(1, 2);
    cluster.load(T, 6, num(1)).unwrap();
    let mut a = cluster.worker(PartitionId(0), 0).unwrap();
    let mut b = cluster.worker(PartitionId(0), 1).unwrap();

    let mut ta = a.begin(false).unwrap();
    let mut tb = b.begin(false).unwrap();
    ta.get(T, 6).unwrap();
    tb.get(T, 6).unwrap();

    // Two readers share the lease, so neither may upgrade
    ta.add(T, 6, num(2)).unwrap();
    let err = ta.end().unwrap_err();
    assert!(matches!(err, EngineError::LockTimeout { .. }), "{}", err);

    tb.end().unwrap();
}
