//! Write locks: mutual exclusion across partitions and deadlock-freedom of
//! the ordered fallback.

use crate::common::*;
use epochkv::{PartitionId, Worker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

fn increment(w: &mut Worker, key: u64) -> bool {
    w.run(false, 1_000, |txn| {
        txn.update(T, key, |v| Some(num(vec_num(v) + 1)))
    })
    .is_ok()
}

#[test]
fn test_counter_has_no_lost_increments() {
    const ROUNDS: usize = 50;
    let cluster = ticking_cluster(2, 2);
    let key = key_on(&cluster, PartitionId(0), 3);
    let workers = cluster.workers().unwrap();
    let barrier = Barrier::new(workers.len());

    let successes: usize = thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|mut w| {
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    (0..ROUNDS).filter(|_| increment(&mut w, key)).count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert!(successes > 0);

    let mut w = cluster.worker(PartitionId(1), 0).unwrap();
    let mut txn = w.begin(false).unwrap();
    assert_eq!(vec_num(txn.get_for_update(T, key).unwrap()), successes as u64);
}

#[test]
fn test_opposite_write_orders_never_deadlock() {
    const ROUNDS: usize = 20;
    let cluster = ticking_cluster(2, 1);
    let a = key_on(&cluster, PartitionId(0), 0);
    let b = key_on(&cluster, PartitionId(1), 0);
    let workers = cluster.workers().unwrap();
    let barrier = Barrier::new(2);
    let started = Instant::now();

    thread::scope(|s| {
        for (i, mut w) in workers.into_iter().enumerate() {
            let barrier = &barrier;
            s.spawn(move || {
                let order = if i == 0 { [a, b] } else { [b, a] };
                for round in 0..ROUNDS {
                    barrier.wait();
                    let value = num((round * 2 + i) as u64);
                    let committed = w.run(false, 1_000, |txn| {
                        for key in order {
                            txn.add(T, key, value.clone())?;
                        }
                        Ok(())
                    });
                    assert!(committed.is_ok(), "round {}: {:?}", round, committed);
                }
            });
        }
    });
    assert!(started.elapsed() < Duration::from_secs(30));

    // Both keys always come from the same transaction
    let mut w = cluster.worker(PartitionId(0), 0).unwrap();
    let mut txn = w.begin(false).unwrap();
    let va = vec_num(txn.get_for_update(T, a).unwrap());
    let vb = vec_num(txn.get_for_update(T, b).unwrap());
    assert_eq!(va, vb);
}

#[test]
fn test_fallback_after_lock_timeout_still_commits() {
    let cluster = manual_cluster(1, 2);
    let mut holder = cluster.worker(PartitionId(0), 0).unwrap();
    let mut waiter = cluster.worker(PartitionId(0), 1).unwrap();

    thread::scope(|s| {
        let mut h = holder.begin(false).unwrap();
        h.get_for_update(T, 1).unwrap();
        let waiting = s.spawn(move || {
            let mut txn = waiter.begin(false).unwrap();
            txn.add(T, 2, num(2)).unwrap();
            txn.add(T, 1, num(1)).unwrap();
            txn.end()
        });
        // Hold past the optimistic lock deadline, release inside the fallback one
        thread::sleep(Duration::from_millis(30));
        h.abort().unwrap();
        let result = waiting.join().unwrap();
        assert!(result.is_ok(), "{:?}", result);
    });
}

#[test]
fn test_random_transfers_conserve_total() {
    const ACCOUNTS: u64 = 16;
    const TRANSFERS: usize = 40;
    let cluster = ticking_cluster(2, 2);
    for key in 0..ACCOUNTS {
        cluster.load(T, key, num(100)).unwrap();
    }
    let workers = cluster.workers().unwrap();

    thread::scope(|s| {
        for (seed, mut w) in workers.into_iter().enumerate() {
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                for _ in 0..TRANSFERS {
                    let from = rng.gen_range(0..ACCOUNTS);
                    let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                    let amount = rng.gen_range(1..=10u64);
                    // Aborts after exhausting retries are fine; partial transfers are not
                    let _ = w.run(false, 100, |txn| {
                        let (lo, hi) = (from.min(to), from.max(to));
                        let lo_balance = vec_num(txn.get_for_update(T, lo)?);
                        let hi_balance = vec_num(txn.get_for_update(T, hi)?);
                        let (src, dst) = if from == lo {
                            (lo_balance, hi_balance)
                        } else {
                            (hi_balance, lo_balance)
                        };
                        if src < amount {
                            return Ok(());
                        }
                        txn.add(T, from, num(src - amount))?;
                        txn.add(T, to, num(dst + amount))
                    });
                }
            });
        }
    });

    let total: u64 = (0..2)
        .flat_map(|p| cluster.loader(PartitionId(p)).unwrap().scan(T).unwrap())
        .map(|(_, v)| u64::from_le_bytes(v.as_ref().try_into().unwrap()))
        .sum();
    assert_eq!(total, ACCOUNTS * 100);
}
