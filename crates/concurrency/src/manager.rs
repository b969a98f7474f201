//! Transaction manager
//!
//! Process-wide state shared by every worker and partition server:
//! - transaction ids
//! - the global commit sequence used for first-committer-wins checks
//! - locks left behind by finished transactions
//! - outcome metrics
//!
//! ## Commit sequence
//!
//! A read-write transaction records the current sequence at Begin
//! (`begin_seq`). At commit, once every write lock is held and every lease
//! validated, it allocates the next sequence and stamps its versions with
//! it. Locking a record whose newest version carries a sequence above the
//! locker's `begin_seq` means another transaction committed to that record
//! after the locker began, and the locker must abort.
//!
//! ## Stranded locks
//!
//! A transaction that cannot confirm a remote release before its deadline
//! records the lock here before it finishes: the owner, the record, and for
//! a committed transaction the version the release was carrying. The lock
//! word stays as it was. Whoever next finds the record locked by a
//! finished owner, a partition server or a worker of the owning partition,
//! calls [`TransactionManager::resolve`]: the pending version is installed
//! (or a record that was never written is dropped) and the lock released.
//! Every read and lock path resolves before it looks at the record, so a
//! committed version is in place before anyone can observe its absence.

use crate::lease::{self, LockState};
use dashmap::DashMap;
use epochkv_core::{Key, RecordKey};
use epochkv_storage::{Record, Table, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transaction outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionMetrics {
    /// Transactions begun
    pub begun: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions aborted, explicitly or by failure
    pub aborted: u64,
}

impl TransactionMetrics {
    /// Transactions neither committed nor aborted
    pub fn active(&self) -> u64 {
        self.begun.saturating_sub(self.committed + self.aborted)
    }

    /// Committed share of finished transactions
    pub fn commit_rate(&self) -> f64 {
        let finished = self.committed + self.aborted;
        if finished == 0 {
            0.0
        } else {
            self.committed as f64 / finished as f64
        }
    }
}

/// Id allocation, commit sequencing and metrics
///
/// # Thread Safety
///
/// All methods are lock-free atomics. Sequence gaps are possible: a
/// sequence number is only consumed by a transaction that has passed
/// validation, but consumers must not assume contiguity.
#[derive(Debug)]
pub struct TransactionManager {
    /// Global commit sequence
    ///
    /// Monotonically increasing. Each committed read-write transaction
    /// increments by 1.
    commit_seq: AtomicU64,

    /// Next transaction ID
    next_txn_id: AtomicU64,

    /// Locks of finished transactions, with the write-back they still owe
    stranded: DashMap<(u64, RecordKey), Option<Version>>,

    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    /// Create a manager with sequence 0 and first transaction id 1
    pub fn new() -> Self {
        TransactionManager {
            commit_seq: AtomicU64::new(0),
            next_txn_id: AtomicU64::new(1),
            stranded: DashMap::new(),
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Allocate the next transaction ID and count the transaction as begun
    pub fn next_txn_id(&self) -> u64 {
        self.begun.fetch_add(1, Ordering::Relaxed);
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Current commit sequence
    pub fn current_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::SeqCst)
    }

    /// Allocate the next commit sequence
    pub fn allocate_seq(&self) -> u64 {
        self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a commit
    pub fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an abort
    pub fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lock `owner` could not release on `key`
    ///
    /// `write_back` is the committed version the release was carrying,
    /// `None` for an abort.
    pub fn strand(&self, owner: u64, key: RecordKey, write_back: Option<Version>) {
        tracing::warn!(owner, record = %key, pending = write_back.is_some(), "lock stranded");
        self.stranded.insert((owner, key), write_back);
    }

    /// Number of stranded locks not yet resolved
    pub fn stranded_locks(&self) -> usize {
        self.stranded.len()
    }

    /// Finish a stranded lock on `record` of `table`, if it holds one
    ///
    /// Returns whether a lock was released. Concurrent resolvers of the
    /// same lock install the same version, and only one unlock succeeds.
    pub fn resolve(&self, table: &Table, key: Key, record: &Arc<Record>) -> bool {
        let LockState::Locked { owner } = lease::state(record.lock_word(), 0) else {
            return false;
        };
        let id = (owner, RecordKey::new(table.id(), key));
        let Some(write_back) = self.stranded.get(&id).map(|e| e.value().clone()) else {
            return false;
        };
        match write_back {
            Some(version) => record.install(version),
            None => {
                table.remove_vacant(key, record);
            }
        }
        let released = lease::unlock(record.lock_word(), owner);
        self.stranded.remove(&id);
        tracing::debug!(owner, record = %id.1, released, "stranded lock resolved");
        released
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> TransactionMetrics {
        TransactionMetrics {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
