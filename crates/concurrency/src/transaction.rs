//! Transaction coordinator
//!
//! A [`Worker`] is one registered thread of a partition. It runs at most one
//! [`Transaction`] at a time; the borrow checker enforces this because a
//! transaction holds the worker mutably.
//!
//! ## Lifecycle
//!
//! ```text
//! begin(readonly)  Active
//! end()            read-only:  Active -> Committed
//!                  read-write: Active -> Validating -> Committed | Aborted
//! abort() / drop   Active -> Aborted
//! ```
//!
//! Read-only transactions read at the pinned safe snapshot and never
//! validate. Read-write transactions read the latest committed versions
//! under read leases, lock their write-set at commit (optimistically, then
//! in canonical order on timeout), validate the leases, install local
//! writes inside the partition's atomic region and ship remote writes with
//! the lock release. A key read and then written keeps its lease until the
//! lock takes it over.
//!
//! Once the local writes are in, the commit is decided. A remote release
//! that cannot be confirmed does not undo it: its version is stranded with
//! the [`TransactionManager`](crate::manager::TransactionManager) and
//! installed by the next access to the record. Every failure before that
//! point rolls back with nothing installed anywhere.
//!
//! Any error other than a caller misuse aborts the transaction before it
//! is returned, so no lock or lease outlives a failed transaction.

use crate::backoff::Backoff;
use crate::context::ClusterContext;
use crate::iterator::TxIterator;
use crate::protocol::Protocol;
use crate::rwset::{Bucket, RwItem, RwSet};
use epochkv_core::{Error, Key, PartitionId, RecordKey, Result, TableId, ThreadId};
use epochkv_storage::{Record, Value, Version};
use epochkv_transport::Transport;
use std::fmt;
use std::sync::Arc;

/// Status of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is executing, can read/write
    Active,
    /// Commit is locking and validating
    Validating,
    /// Transaction committed successfully
    Committed,
    /// Transaction was aborted
    Aborted {
        /// Human-readable reason for abort
        reason: String,
    },
}

impl TransactionStatus {
    fn is_live(&self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::Validating)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Active => write!(f, "active"),
            TransactionStatus::Validating => write!(f, "validating"),
            TransactionStatus::Committed => write!(f, "committed"),
            TransactionStatus::Aborted { reason } => write!(f, "aborted ({})", reason),
        }
    }
}

/// Outcome of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    /// Transaction id
    pub txn_id: u64,
    /// Snapshot the writes are stamped with; the read snapshot for
    /// read-only transactions
    pub commit_ss: u64,
    /// Commit sequence number, `None` when nothing was written
    pub commit_seq: Option<u64>,
    /// Number of writes and deletes installed
    pub writes: usize,
}

/// A registered worker thread of one partition
pub struct Worker {
    ctx: Arc<ClusterContext>,
    pid: PartitionId,
    tid: ThreadId,
    protocol: Protocol,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("partition", &self.pid)
            .field("tid", &self.tid)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Worker {
    /// Register worker `index` of partition `pid`
    ///
    /// `endpoint` must be bound to the worker's address,
    /// [`Address::worker(pid, index)`](epochkv_core::Address::worker).
    pub fn new(
        ctx: Arc<ClusterContext>,
        pid: PartitionId,
        index: u32,
        endpoint: Box<dyn Transport>,
    ) -> Result<Self> {
        if index >= ctx.config().workers_per_partition {
            return Err(Error::Config(format!(
                "worker index {} out of range for {} workers per partition",
                index,
                ctx.config().workers_per_partition
            )));
        }
        let partition = Arc::clone(ctx.partition(pid)?);
        let tid = ctx.thread_id(pid, index);
        ctx.snapshots().register_thread(tid)?;
        let protocol = Protocol::new(
            partition,
            endpoint,
            Arc::clone(ctx.snapshots()),
            Arc::clone(ctx.manager()),
            ctx.timing(),
        );
        tracing::debug!(tid, partition = %pid, "worker registered");
        Ok(Self {
            ctx,
            pid,
            tid,
            protocol,
        })
    }

    /// Snapshot-manager slot
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Partition this worker belongs to
    pub fn partition(&self) -> PartitionId {
        self.pid
    }

    /// Shared cluster state
    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    /// Start a transaction
    ///
    /// A read-only transaction reads at the safe snapshot, pinned until it
    /// ends. A read-write transaction publishes the current global SS as
    /// this thread's watermark and records the commit sequence it started
    /// from.
    pub fn begin(&mut self, readonly: bool) -> Result<Transaction<'_>> {
        let snapshots = Arc::clone(self.ctx.snapshots());
        let (localsn, lastsn, begin_seq) = if readonly {
            let snapshot = snapshots.pin_snapshot(self.tid)?;
            (snapshot, snapshots.global_ss(), 0)
        } else {
            let global = snapshots.global_ss();
            snapshots.update_local_ss(self.tid, global)?;
            (global, global, self.ctx.manager().current_seq())
        };
        let txn_id = self.ctx.manager().next_txn_id();
        tracing::trace!(txn = txn_id, tid = self.tid, readonly, ss = localsn, "begin");
        Ok(Transaction {
            worker: self,
            txn_id,
            readonly,
            localsn,
            lastsn,
            begin_seq,
            iter_snapshot: None,
            set: RwSet::new(),
            status: TransactionStatus::Active,
        })
    }

    /// Run `body` in a transaction and commit it, retrying on contention
    ///
    /// The body is re-run from a fresh Begin up to `max_retries` times
    /// when the attempt fails with a contention error. Other errors are
    /// returned at once.
    pub fn run<T, F>(&mut self, readonly: bool, max_retries: usize, mut body: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let mut backoff = Backoff::new(self.ctx.timing().poll);
        let mut attempt = 0;
        loop {
            let mut txn = self.begin(readonly)?;
            let outcome = body(&mut txn).and_then(|value| txn.end().map(|_| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_contention() && attempt < max_retries => {
                    attempt += 1;
                    tracing::debug!(tid = self.tid, attempt, error = %e, "retrying transaction");
                    backoff.snooze();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until a commit is visible to read-only transactions
    ///
    /// Needs the global SS to move past the commit snapshot, so with manual
    /// epochs the caller must advance it.
    pub fn wait_visible(&self, info: &CommitInfo) {
        self.ctx.snapshots().wait_until(info.commit_ss + 1);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.ctx.snapshots().deregister_thread(self.tid);
    }
}

/// One transaction on a [`Worker`]
#[derive(Debug)]
pub struct Transaction<'a> {
    worker: &'a mut Worker,
    txn_id: u64,
    readonly: bool,
    /// Snapshot assigned at Begin
    localsn: u64,
    /// Global SS observed at Begin
    lastsn: u64,
    begin_seq: u64,
    iter_snapshot: Option<u64>,
    set: RwSet,
    status: TransactionStatus,
}

impl<'a> Transaction<'a> {
    /// Transaction id
    pub fn id(&self) -> u64 {
        self.txn_id
    }

    /// Current status
    pub fn status(&self) -> &TransactionStatus {
        &self.status
    }

    /// Whether the transaction was begun read-only
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Snapshot assigned at Begin
    pub fn snapshot(&self) -> u64 {
        self.localsn
    }

    /// Number of keys touched
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether no key was touched yet
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Number of pending writes and deletes
    pub fn write_count(&self) -> usize {
        self.set.write_count()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status == TransactionStatus::Active {
            Ok(())
        } else {
            Err(Error::NotActive(format!(
                "transaction {} is {}",
                self.txn_id, self.status
            )))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.readonly {
            return Err(Error::ReadOnlyViolation);
        }
        Ok(())
    }

    /// Abort on anything but a misuse and hand the error back
    fn fail(&mut self, e: Error) -> Error {
        if !e.is_misuse() && self.status.is_live() {
            self.rollback(e.to_string());
        }
        e
    }

    fn locate(&self, table: TableId, key: Key) -> Result<(RecordKey, PartitionId)> {
        // Every partition declares the same tables
        self.worker.protocol.local_partition().table(table)?;
        Ok((RecordKey::new(table, key), self.worker.ctx.partition_of(key)))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `key`
    ///
    /// Pending writes of this transaction are returned first, then values
    /// already read. Otherwise a read-only transaction reads at its
    /// snapshot and a read-write transaction takes a read lease and reads
    /// the latest committed value. Writing the key later in the same
    /// transaction upgrades that lease to the lock at commit, unless another
    /// reader shares it.
    pub fn get(&mut self, table: TableId, key: Key) -> Result<Option<Value>> {
        self.ensure_active()?;
        let (rk, pid) = self.locate(table, key)?;
        if let Some(item) = self.set.get(&rk) {
            return Ok(item.value.clone());
        }

        let bucket = if self.readonly {
            Bucket::ReadOnly
        } else if self.worker.protocol.is_local(pid) {
            Bucket::LocalRead
        } else {
            Bucket::RemoteRead
        };
        let mut item = RwItem::new(rk, pid, bucket);
        let read = if self.readonly {
            self.worker.protocol.snapshot_read(&mut item, self.localsn)
        } else {
            self.worker.protocol.get_lease(&mut item)
        };
        if let Err(e) = read {
            return Err(self.fail(e));
        }
        tracing::trace!(txn = self.txn_id, record = %rk, lease = ?item.lease_end, "read");
        let value = item.value.clone();
        self.set.insert(item);
        Ok(value)
    }

    /// Lock `key` now and return a private copy of its latest value
    ///
    /// The key joins the write-set with its current value, so it is written
    /// back unchanged unless the caller adds a new value.
    pub fn get_for_update(&mut self, table: TableId, key: Key) -> Result<Option<Vec<u8>>> {
        self.ensure_writable()?;
        let (rk, pid) = self.locate(table, key)?;
        let (owner, begin_seq) = (self.txn_id, self.begin_seq);
        let retry = self.worker.protocol.timing().lock;

        let item = self.set.insert(RwItem::new(rk, pid, Bucket::Write));
        let pending = item.is_write();
        item.bucket = Bucket::Write;
        let mut locked = self.worker.protocol.lock(item, owner, begin_seq, retry);
        if locked.is_ok() && !pending {
            // Nobody can install past a held lock
            locked = self.worker.protocol.snapshot_read(item, u64::MAX);
        }
        if let Err(e) = locked {
            return Err(self.fail(e));
        }
        tracing::trace!(txn = self.txn_id, record = %rk, "locked for update");
        Ok(self
            .set
            .get(&rk)
            .and_then(|i| i.value.as_deref())
            .map(<[u8]>::to_vec))
    }

    /// Replace `key`'s value with `f(current)` (`None` deletes)
    pub fn update<F>(&mut self, table: TableId, key: Key, f: F) -> Result<()>
    where
        F: FnOnce(Option<Vec<u8>>) -> Option<Vec<u8>>,
    {
        let current = self.get_for_update(table, key)?;
        let next = f(current).map(Value::from);
        if let Some(item) = self.set.get_mut(&RecordKey::new(table, key)) {
            item.value = next;
        }
        Ok(())
    }

    /// Cursor over `table` on this worker's partition
    ///
    /// Only records stored on the worker's own partition are visited; keys
    /// owned by other partitions never appear. A read-only transaction
    /// iterates at its Begin snapshot. A read-write transaction iterates at
    /// the safe snapshot, pinned on first use and reused by later cursors,
    /// not at its Begin snapshot. The scan takes no leases and is not
    /// validated at commit. The transaction's own pending writes are skipped.
    pub fn get_iterator(&mut self, table: TableId) -> Result<TxIterator> {
        self.ensure_active()?;
        let snapshot = if self.readonly {
            self.localsn
        } else if let Some(s) = self.iter_snapshot {
            s
        } else {
            let s = self.worker.ctx.snapshots().pin_snapshot(self.worker.tid)?;
            self.iter_snapshot = Some(s);
            s
        };
        let partition = Arc::clone(self.worker.ctx.partition(self.worker.pid)?);
        TxIterator::new(partition, Arc::clone(self.worker.ctx.manager()), table, snapshot)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `value` to `key` at commit
    ///
    /// # Errors
    /// - [`Error::ReadOnlyViolation`] in a read-only transaction
    /// - [`Error::StoreFull`] when a local key cannot be indexed (aborts)
    pub fn add(&mut self, table: TableId, key: Key, value: impl Into<Value>) -> Result<()> {
        self.write(table, key, Some(value.into()))
    }

    /// Delete `key` at commit
    pub fn delete(&mut self, table: TableId, key: Key) -> Result<()> {
        self.write(table, key, None)
    }

    fn write(&mut self, table: TableId, key: Key, value: Option<Value>) -> Result<()> {
        self.ensure_writable()?;
        let (rk, pid) = self.locate(table, key)?;

        // Local keys get their index slot now so a full store fails here
        let mut reserved = None;
        if self.worker.protocol.is_local(pid) {
            let slot = self
                .worker
                .protocol
                .local_partition()
                .table(table)
                .and_then(|t| t.get_or_insert(key));
            match slot {
                Ok(found) => reserved = Some(found),
                Err(e) => return Err(self.fail(e)),
            }
        }

        let item = self.set.upsert_write(rk, pid, value);
        if let (None, Some((slot, record))) = (&item.record, reserved) {
            item.slot = Some(slot as u64);
            item.record = Some(record);
        }
        tracing::trace!(txn = self.txn_id, record = %rk, "write registered");
        Ok(())
    }

    // =========================================================================
    // Commit / abort
    // =========================================================================

    /// Commit
    ///
    /// # Errors
    /// - contention errors (lock/lease timeouts, lapsed leases, write
    ///   conflicts, region aborts): the transaction was aborted and may be
    ///   retried
    /// - transport errors before the local writes are installed: aborted
    ///
    /// Remote releases that fail after the local writes are installed do
    /// not fail the commit; see the module docs.
    pub fn end(mut self) -> Result<CommitInfo> {
        self.ensure_active()?;
        if self.readonly {
            return Ok(self.finish_readonly());
        }
        self.status = TransactionStatus::Validating;
        self.commit_read_write().map_err(|e| self.fail(e))
    }

    /// Abort, releasing every lock and lease taken so far
    ///
    /// # Errors
    /// [`Error::Transport`] when some remote lock release was not
    /// confirmed. The transaction is aborted regardless; those locks are
    /// stranded and freed by the next access to their records.
    pub fn abort(mut self) -> Result<()> {
        self.ensure_active()?;
        let stranded = self.rollback("aborted by caller".to_string());
        if stranded > 0 {
            return Err(Error::Transport(format!(
                "abort of transaction {} left {} lock releases unconfirmed",
                self.txn_id, stranded
            )));
        }
        Ok(())
    }

    fn finish_readonly(&mut self) -> CommitInfo {
        let snapshots = self.worker.ctx.snapshots();
        snapshots.unpin(self.worker.tid);
        self.worker.ctx.manager().record_commit();
        self.status = TransactionStatus::Committed;
        tracing::trace!(txn = self.txn_id, ss = self.localsn, reads = self.set.len(), "read-only commit");
        self.set.clear();
        CommitInfo {
            txn_id: self.txn_id,
            commit_ss: self.localsn,
            commit_seq: None,
            writes: 0,
        }
    }

    fn lock_write_set(&mut self) -> Result<()> {
        let (owner, begin_seq) = (self.txn_id, self.begin_seq);
        let retry = self.worker.protocol.timing().lock;
        for n in self.set.write_order(self.worker.pid) {
            match self.worker.protocol.lock(self.set.at_mut(n), owner, begin_seq, retry) {
                Ok(()) => {}
                Err(Error::LockTimeout { table, key }) => {
                    tracing::debug!(txn = owner, table = %table, key, "lock timed out, falling back");
                    return self
                        .worker
                        .protocol
                        .fallback_lock_all(&mut self.set, owner, begin_seq);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn commit_read_write(&mut self) -> Result<CommitInfo> {
        let tid = self.worker.tid;
        let writes = self.set.write_count();

        if writes > 0 {
            self.lock_write_set()?;
        }
        let commit_ss = self.worker.ctx.snapshots().global_ss();
        self.worker.protocol.all_leases_valid(&self.set, self.lastsn)?;

        if writes == 0 {
            self.worker.protocol.release_leases(&mut self.set);
            self.worker.ctx.snapshots().quiesce(tid)?;
            self.worker.ctx.snapshots().unpin(tid);
            self.worker.ctx.manager().record_commit();
            self.status = TransactionStatus::Committed;
            self.set.clear();
            return Ok(CommitInfo {
                txn_id: self.txn_id,
                commit_ss,
                commit_seq: None,
                writes: 0,
            });
        }

        let seq = self.worker.ctx.manager().allocate_seq();
        let version = |item: &RwItem| Version {
            stamp: commit_ss,
            seq,
            value: item.value.clone(),
        };

        let order = self.set.write_order(self.worker.pid);
        let (local, remote): (Vec<usize>, Vec<usize>) = order
            .into_iter()
            .partition(|&n| self.worker.protocol.is_local(self.set.at(n).pid));

        let mut installs: Vec<(Arc<Record>, Version)> = Vec::with_capacity(local.len());
        for &n in &local {
            let item = self.set.at(n);
            let record = item.record.clone().ok_or_else(|| {
                Error::Internal(format!("local write {} has no record", item.key))
            })?;
            installs.push((record, version(item)));
        }

        // Local writes become visible together or not at all
        let protocol = &self.worker.protocol;
        let set = &self.set;
        protocol.in_region(|| {
            protocol.all_local_leases_valid(set)?;
            for (record, version) in &installs {
                record.install(version.clone());
            }
            Ok::<_, Error>(())
        })??;

        // Decided: from here on nothing is undone
        let owner = self.txn_id;
        let mut stranded = 0;
        for n in remote {
            let wb = version(self.set.at(n));
            if !self.worker.protocol.write_back(self.set.at_mut(n), owner, wb) {
                stranded += 1;
            }
        }
        for n in local {
            let item = self.set.at_mut(n);
            if let Err(e) = self.worker.protocol.release(item, owner, None) {
                tracing::warn!(txn = owner, record = %item.key, error = %e, "local release failed");
            }
        }
        self.worker.protocol.release_leases(&mut self.set);

        if let Err(e) = self.worker.ctx.snapshots().publish_commit(tid, commit_ss) {
            tracing::error!(txn = owner, tid, error = %e, "commit watermark not published");
        }
        self.worker.ctx.snapshots().unpin(tid);
        self.set.clear();

        self.worker.ctx.manager().record_commit();
        self.status = TransactionStatus::Committed;
        tracing::debug!(txn = owner, ss = commit_ss, seq, writes, stranded, "committed");
        Ok(CommitInfo {
            txn_id: owner,
            commit_ss,
            commit_seq: Some(seq),
            writes,
        })
    }

    /// Release everything and mark the transaction aborted
    ///
    /// Returns the number of lock releases left stranded.
    fn rollback(&mut self, reason: String) -> usize {
        let tid = self.worker.tid;
        let stranded = self.worker.protocol.release_all(&mut self.set, self.txn_id);
        if stranded > 0 {
            tracing::warn!(txn = self.txn_id, stranded, "lock releases left for resolution");
        }
        self.worker.protocol.release_leases(&mut self.set);
        let snapshots = self.worker.ctx.snapshots();
        if !self.readonly {
            if let Err(e) = snapshots.quiesce(tid) {
                tracing::warn!(txn = self.txn_id, tid, error = %e, "quiesce failed");
            }
        }
        snapshots.unpin(tid);
        self.worker.ctx.manager().record_abort();
        tracing::debug!(txn = self.txn_id, reason = %reason, "transaction aborted");
        self.status = TransactionStatus::Aborted { reason };
        self.set.clear();
        stranded
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.status.is_live() {
            self.rollback("dropped while active".to_string());
        }
    }
}
