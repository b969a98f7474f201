//! Transport failures, store exhaustion and caller misuse.

use crate::common::*;
use epochkv::{BackendKind, EngineError, PartitionId, TableId, TransactionStatus};

#[test]
fn test_severed_partition_aborts_and_releases_local_locks() {
    let cluster = manual_cluster(2, 2);
    let local = key_on(&cluster, PartitionId(0), 0);
    let remote = key_on(&cluster, PartitionId(1), 0);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    let mut other = cluster.worker(PartitionId(0), 1).unwrap();

    cluster.sever_partition(PartitionId(1));
    let mut txn = w.begin(false).unwrap();
    txn.add(T, local, num(1)).unwrap();
    txn.add(T, remote, num(1)).unwrap();
    let err = txn.end().unwrap_err();
    assert!(err.is_transport(), "{}", err);
    assert!(err.is_retryable());

    // The local key was locked first and must be free again
    let mut txn = other.begin(false).unwrap();
    txn.add(T, local, num(2)).unwrap();
    txn.end().unwrap();

    cluster.heal_partition(PartitionId(1));
    let mut txn = w.begin(false).unwrap();
    txn.add(T, remote, num(3)).unwrap();
    txn.end().unwrap();

    cluster.advance_epoch();
    let mut ro = w.begin(true).unwrap();
    assert_eq!(as_num(ro.get(T, local).unwrap()), Some(2));
    assert_eq!(as_num(ro.get(T, remote).unwrap()), Some(3));
}

#[test]
fn test_sever_during_abort_strands_then_frees_remote_lock() {
    let cluster = manual_cluster(2, 2);
    let remote = key_on(&cluster, PartitionId(1), 0);
    cluster.load(T, remote, num(0)).unwrap();
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    let mut other = cluster.worker(PartitionId(0), 1).unwrap();

    let mut txn = w.begin(false).unwrap();
    assert_eq!(vec_num(txn.get_for_update(T, remote).unwrap()), 0);
    cluster.sever_partition(PartitionId(1));
    let err = txn.abort().unwrap_err();
    assert!(err.is_transport(), "{}", err);
    assert_eq!(cluster.stranded_locks(), 1);

    cluster.heal_partition(PartitionId(1));
    cluster.advance_epoch();
    for n in 1..=3 {
        let mut txn = other.begin(false).unwrap();
        txn.update(T, remote, |v| Some(num(vec_num(v) + 1))).unwrap();
        assert_eq!(txn.end().unwrap().writes, 1, "writer {}", n);
    }
    assert_eq!(cluster.stranded_locks(), 0);

    cluster.advance_epoch();
    let mut ro = w.begin(true).unwrap();
    assert_eq!(as_num(ro.get(T, remote).unwrap()), Some(3));
}

#[test]
fn test_commit_with_unconfirmed_write_back_is_rolled_forward() {
    let cluster = manual_cluster(2, 1);
    let local = key_on(&cluster, PartitionId(0), 0);
    let remote = key_on(&cluster, PartitionId(1), 0);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    let mut txn = w.begin(false).unwrap();
    txn.get_for_update(T, remote).unwrap();
    txn.add(T, remote, num(7)).unwrap();
    txn.add(T, local, num(8)).unwrap();
    cluster.sever_partition(PartitionId(1));
    let info = txn.end().unwrap();
    assert_eq!(info.writes, 2);
    assert_eq!(cluster.stranded_locks(), 1);

    cluster.heal_partition(PartitionId(1));
    cluster.advance_epoch();
    let mut ro = w.begin(true).unwrap();
    assert_eq!(as_num(ro.get(T, local).unwrap()), Some(8));
    assert_eq!(as_num(ro.get(T, remote).unwrap()), Some(7));
    ro.end().unwrap();
    assert_eq!(cluster.stranded_locks(), 0);
}

#[test]
fn test_severed_partition_fails_reads() {
    let cluster = manual_cluster(2, 1);
    let remote = key_on(&cluster, PartitionId(1), 2);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    cluster.sever_partition(PartitionId(1));
    for readonly in [true, false] {
        let mut txn = w.begin(readonly).unwrap();
        let err = txn.get(T, remote).unwrap_err();
        assert!(err.is_transport(), "{}", err);
        assert!(matches!(txn.status(), TransactionStatus::Aborted { .. }));
        assert!(matches!(txn.get(T, remote), Err(EngineError::NotActive(_))));
    }
}

#[test]
fn test_local_store_full_aborts_add() {
    let cluster = cluster_with(BackendKind::Cuckoo, 1, 4);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    let mut txn = w.begin(false).unwrap();
    let mut key = 0;
    let err = loop {
        if let Err(e) = txn.add(T, key, num(key)) {
            break e;
        }
        key += 1;
        assert!(key <= 4);
    };
    assert!(matches!(err, EngineError::StoreFull { .. }), "{}", err);
    assert!(matches!(txn.status(), TransactionStatus::Aborted { .. }));
    drop(txn);

    // Nothing was committed
    cluster.advance_epoch();
    let mut ro = w.begin(true).unwrap();
    assert_eq!(ro.get(T, 0).unwrap(), None);
}

#[test]
fn test_remote_store_full_aborts_commit() {
    let cluster = cluster_with(BackendKind::Cluster, 2, 2);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    for n in 0..2 {
        cluster.load(T, key_on(&cluster, PartitionId(1), n), num(0)).unwrap();
    }

    let mut txn = w.begin(false).unwrap();
    txn.add(T, key_on(&cluster, PartitionId(1), 2), num(1)).unwrap();
    let err = txn.end().unwrap_err();
    assert!(matches!(err, EngineError::StoreFull { .. }), "{}", err);
}

#[test]
fn test_aborted_inserts_do_not_exhaust_table() {
    let cluster = cluster_with(BackendKind::Cluster, 2, 4);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    for n in 0..32 {
        let mut txn = w.begin(false).unwrap();
        txn.add(T, key_on(&cluster, PartitionId(0), 100 + n), num(1)).unwrap();
        assert_eq!(txn.get_for_update(T, key_on(&cluster, PartitionId(1), 100 + n)).unwrap(), None);
        txn.abort().unwrap();
    }

    for n in 0..4 {
        let mut txn = w.begin(false).unwrap();
        txn.add(T, key_on(&cluster, PartitionId(0), n), num(1)).unwrap();
        txn.add(T, key_on(&cluster, PartitionId(1), n), num(1)).unwrap();
        txn.end().unwrap();
    }
}

#[test]
fn test_misuse_is_reported_without_abort() {
    let cluster = manual_cluster(1, 1);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    let mut ro = w.begin(true).unwrap();
    assert_eq!(ro.add(T, 1, num(1)), Err(EngineError::ReadOnlyViolation));
    assert_eq!(ro.delete(T, 1), Err(EngineError::ReadOnlyViolation));
    assert_eq!(ro.get(TableId(7), 1), Err(EngineError::UnknownTable(TableId(7))));
    assert_eq!(ro.status(), &TransactionStatus::Active);
    ro.end().unwrap();

    let mut txn = w.begin(false).unwrap();
    assert!(txn.add(TableId(7), 1, num(1)).is_err());
    txn.add(T, 1, num(1)).unwrap();
    txn.end().unwrap();
}

#[test]
fn test_worker_slots_are_exclusive() {
    let cluster = manual_cluster(2, 1);
    let w = cluster.worker(PartitionId(1), 0).unwrap();
    assert!(cluster.worker(PartitionId(1), 0).is_err());
    assert!(cluster.worker(PartitionId(1), 1).is_err());
    assert!(cluster.worker(PartitionId(2), 0).is_err());
    drop(w);
    assert!(cluster.worker(PartitionId(1), 0).is_ok());
}
