//! The same transactional workload over every index backend.

use crate::common::*;
use epochkv::{BackendKind, PartitionId};

fn exercise(kind: BackendKind) {
    let cluster = cluster_with(kind, 2, 256);
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();

    for batch in 0..10u64 {
        w.run(false, 10, |txn| {
            for key in batch * 10..(batch + 1) * 10 {
                txn.add(T, key, num(key * 3))?;
            }
            Ok(())
        })
        .unwrap();
    }
    w.run(false, 10, |txn| {
        for key in (0..100u64).step_by(7) {
            txn.delete(T, key)?;
        }
        Ok(())
    })
    .unwrap();
    cluster.advance_epoch();

    let mut ro = w.begin(true).unwrap();
    for key in 0..100u64 {
        let expected = if key % 7 == 0 { None } else { Some(key * 3) };
        assert_eq!(as_num(ro.get(T, key).unwrap()), expected, "{:?} key {}", kind, key);
    }
    ro.end().unwrap();

    let stored: usize = (0..2)
        .map(|p| cluster.loader(PartitionId(p)).unwrap().scan(T).unwrap().len())
        .sum();
    assert_eq!(stored, 100 - (0..100).step_by(7).count());
}

#[test]
fn test_cuckoo_backend() {
    exercise(BackendKind::Cuckoo);
}

#[test]
fn test_hopscotch_backend() {
    exercise(BackendKind::Hopscotch);
}

#[test]
fn test_cluster_backend() {
    exercise(BackendKind::Cluster);
}
