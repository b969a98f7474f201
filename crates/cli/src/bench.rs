//! Bank-transfer workload.
//!
//! Every account starts with [`INITIAL_BALANCE`]. Read-write transactions
//! move a small amount between two random accounts; read-only audits sum
//! every balance and check the total never changes.

use crate::parse::{BenchOptions, ACCOUNTS};
use anyhow::{Context, Result};
use epochkv::{Cluster, EngineError, Key, Transaction, Worker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

/// Starting balance of every account.
pub const INITIAL_BALANCE: u64 = 1_000;

const MAX_TRANSFER: u64 = 10;

/// Workload outcome.
#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub partitions: u32,
    pub workers: usize,
    pub backend: String,
    pub accounts: u64,
    pub seconds: f64,
    pub transfers: u64,
    pub audits: u64,
    pub aborted: u64,
    pub errors: u64,
    pub audit_violations: u64,
    pub throughput: f64,
    pub commit_rate: f64,
    pub remote_requests: u64,
    pub epochs: EpochReport,
}

/// Epoch timing, in microseconds.
#[derive(Debug, Serialize)]
pub struct EpochReport {
    pub ticks: u64,
    pub mean_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub late: u64,
}

#[derive(Debug, Default)]
struct Counters {
    transfers: AtomicU64,
    audits: AtomicU64,
    aborted: AtomicU64,
    errors: AtomicU64,
    violations: AtomicU64,
}

fn balance(v: Option<Vec<u8>>) -> u64 {
    v.and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

/// Run the workload described by `opts`.
pub fn run(opts: &BenchOptions) -> Result<BenchReport> {
    let cluster = Cluster::builder()
        .config(opts.config.clone())
        .build()
        .context("failed to start cluster")?;

    for key in 0..opts.accounts {
        cluster
            .load(ACCOUNTS, key, INITIAL_BALANCE.to_le_bytes().to_vec())
            .with_context(|| format!("failed to load account {}", key))?;
    }
    let workers = cluster.workers().context("failed to register workers")?;
    tracing::info!(accounts = opts.accounts, workers = workers.len(), "workload starting");

    let counters = Counters::default();
    let stop = AtomicBool::new(false);
    let started = Instant::now();
    thread::scope(|s| {
        for worker in workers {
            let (counters, stop) = (&counters, &stop);
            s.spawn(move || drive(worker, opts, counters, stop));
        }
        thread::sleep(opts.duration);
        stop.store(true, Ordering::Release);
    });
    let elapsed = started.elapsed().as_secs_f64();

    let metrics = cluster.metrics();
    let epochs = cluster.epoch_stats();
    let config = cluster.config();
    let transfers = counters.transfers.load(Ordering::Relaxed);
    let audits = counters.audits.load(Ordering::Relaxed);
    let report = BenchReport {
        partitions: config.partitions,
        workers: config.total_workers(),
        backend: format!("{:?}", config.backend).to_lowercase(),
        accounts: opts.accounts,
        seconds: elapsed,
        transfers,
        audits,
        aborted: counters.aborted.load(Ordering::Relaxed),
        errors: counters.errors.load(Ordering::Relaxed),
        audit_violations: counters.violations.load(Ordering::Relaxed),
        throughput: (transfers + audits) as f64 / elapsed,
        commit_rate: metrics.commit_rate(),
        remote_requests: cluster.requests_served(),
        epochs: EpochReport {
            ticks: epochs.ticks,
            mean_us: epochs.mean.as_micros() as u64,
            min_us: epochs.min.as_micros() as u64,
            max_us: epochs.max.as_micros() as u64,
            late: epochs.late,
        },
    };
    cluster.shutdown();
    Ok(report)
}

fn drive(mut worker: Worker, opts: &BenchOptions, counters: &Counters, stop: &AtomicBool) {
    let mut rng = StdRng::seed_from_u64(worker.tid() as u64);
    while !stop.load(Ordering::Acquire) {
        let outcome = if rng.gen_bool(opts.readonly_ratio) {
            audit(&mut worker, opts.accounts).map(|total| {
                counters.audits.fetch_add(1, Ordering::Relaxed);
                if total != opts.accounts * INITIAL_BALANCE {
                    counters.violations.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(total, "audit found wrong total balance");
                }
            })
        } else {
            let from = rng.gen_range(0..opts.accounts);
            let to = (from + rng.gen_range(1..opts.accounts)) % opts.accounts;
            let amount = rng.gen_range(1..=MAX_TRANSFER);
            transfer(&mut worker, from, to, amount).map(|_| {
                counters.transfers.fetch_add(1, Ordering::Relaxed);
            })
        };
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_contention() => {
                counters.aborted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(tid = worker.tid(), error = %e, "transaction failed");
            }
        }
    }
}

fn audit(worker: &mut Worker, accounts: u64) -> Result<u64, EngineError> {
    let mut txn = worker.begin(true)?;
    let mut total = 0;
    for key in 0..accounts {
        total += balance(txn.get(ACCOUNTS, key)?.map(|v| v.to_vec()));
    }
    txn.end()?;
    Ok(total)
}

fn transfer(worker: &mut Worker, from: Key, to: Key, amount: u64) -> Result<(), EngineError> {
    let mut txn = worker.begin(false)?;
    // Ascending lock order keeps opposite transfers from stalling each other
    let (lo, hi) = (from.min(to), from.max(to));
    lock(&mut txn, lo)?;
    lock(&mut txn, hi)?;

    let available = balance(txn.get_for_update(ACCOUNTS, from)?);
    if available < amount {
        return txn.abort();
    }
    txn.update(ACCOUNTS, from, |v| Some((balance(v) - amount).to_le_bytes().to_vec()))?;
    txn.update(ACCOUNTS, to, |v| Some((balance(v) + amount).to_le_bytes().to_vec()))?;
    txn.end()?;
    Ok(())
}

fn lock(txn: &mut Transaction<'_>, key: Key) -> Result<(), EngineError> {
    txn.get_for_update(ACCOUNTS, key).map(|_| ())
}
