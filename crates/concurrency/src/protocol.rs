//! Lock/lease protocol
//!
//! Acquires, validates and releases exclusive locks (writes) and read
//! leases (reads) on single records. Records on the worker's own partition
//! are handled in-process on their lock word; records elsewhere go to the
//! owning partition's request server over the messaging channel. Both
//! paths run the same lock-word state machine and the same
//! [`BoundedRetry`] deadlines.
//!
//! Lease expiry is measured in snapshot numbers, never wall-clock time.
//!
//! Releases to other partitions are retried until the fallback deadline. A
//! release that still fails is handed to the [`TransactionManager`] as a
//! stranded lock, resolved by the next access to the record, so no lock
//! outlives its transaction for longer than that.

use crate::backoff::{BoundedRetry, Step};
use crate::context::Timing;
use crate::lease::{self, LeaseOutcome, LockOutcome};
use crate::manager::TransactionManager;
use crate::rwset::{Bucket, RwItem, RwSet};
use crate::snapshot::SnapshotManager;
use epochkv_core::{Address, Error, Key, PartitionId, RecordKey, Result, TableId};
use epochkv_storage::{Partition, Record, Value, Version};
use epochkv_transport::{Body, DenyReason, Frame, Payload, Reply, Request, Transport, TransportError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-worker protocol endpoint
pub struct Protocol {
    local: Arc<Partition>,
    endpoint: Box<dyn Transport>,
    snapshots: Arc<SnapshotManager>,
    manager: Arc<TransactionManager>,
    timing: Timing,
    next_seq: u64,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("local", &self.local.id())
            .field("address", &self.endpoint.address())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

fn to_payload(v: &Version) -> Payload {
    Payload {
        stamp: v.stamp,
        seq: v.seq,
        value: v.value.as_ref().map(|b| b.to_vec()),
    }
}

fn payload_value(p: Option<Payload>) -> Option<Value> {
    p.and_then(|p| p.value).map(Value::from)
}

fn denied(reason: DenyReason, key: RecordKey, pid: PartitionId) -> Error {
    match reason {
        DenyReason::Locked | DenyReason::Leased => Error::LockTimeout {
            table: key.table,
            key: key.key,
        },
        DenyReason::Conflict => Error::WriteConflict {
            table: key.table,
            key: key.key,
        },
        DenyReason::StoreFull => Error::StoreFull {
            table: key.table,
            key: key.key,
        },
        DenyReason::UnknownTable => Error::UnknownTable(key.table),
        DenyReason::NotFound | DenyReason::NotOwner => {
            Error::Internal(format!("{} refused {} on {}", pid, reason_name(reason), key))
        }
    }
}

fn reason_name(reason: DenyReason) -> &'static str {
    match reason {
        DenyReason::Locked => "locked",
        DenyReason::Leased => "leased",
        DenyReason::NotFound => "not found",
        DenyReason::StoreFull => "store full",
        DenyReason::UnknownTable => "unknown table",
        DenyReason::NotOwner => "not owner",
        DenyReason::Conflict => "conflict",
    }
}

fn unexpected(reply: &Reply, key: RecordKey) -> Error {
    Error::Internal(format!("unexpected reply {:?} for {}", reply, key))
}

impl Protocol {
    /// Create a protocol endpoint for a worker on `local`
    pub fn new(
        local: Arc<Partition>,
        endpoint: Box<dyn Transport>,
        snapshots: Arc<SnapshotManager>,
        manager: Arc<TransactionManager>,
        timing: Timing,
    ) -> Self {
        Self {
            local,
            endpoint,
            snapshots,
            manager,
            timing,
            next_seq: 1,
        }
    }

    /// The worker's partition
    pub fn local_partition(&self) -> &Partition {
        &self.local
    }

    /// Deadlines in use
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Whether `pid` is the worker's own partition
    pub fn is_local(&self, pid: PartitionId) -> bool {
        pid == self.local.id()
    }

    fn now(&self) -> u64 {
        self.snapshots.global_ss()
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send one request and wait for its reply
    ///
    /// Replies to earlier, abandoned requests are discarded by sequence
    /// number.
    fn round_trip(
        &mut self,
        pid: PartitionId,
        table: TableId,
        key: Key,
        timestamp: u64,
        request: Request,
    ) -> Result<Reply> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let bytes = Frame::request(table, key, timestamp, seq, request).encode()?;
        self.endpoint.send(Address::server(pid), bytes)?;

        let deadline = Instant::now() + self.timing.remote_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let envelope = match self.endpoint.recv_timeout(remaining) {
                Ok(env) => env,
                Err(TransportError::Timeout) => {
                    tracing::debug!(partition = %pid, seq, "remote request timed out");
                    return Err(Error::RemoteTimeout { partition: pid });
                }
                Err(e) => return Err(e.into()),
            };
            let frame = match Frame::decode(&envelope.payload) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(from = %envelope.from, error = %e, "dropping malformed reply");
                    continue;
                }
            };
            match frame.body {
                Body::Reply(reply) if frame.header.seq == seq => return Ok(reply),
                _ => tracing::trace!(stale = frame.header.seq, seq, "dropping stale reply"),
            }
        }
    }

    /// Send one request without waiting; its reply is dropped as stale
    fn notify(&mut self, pid: PartitionId, key: RecordKey, request: Request) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let bytes = Frame::request(key.table, key.key, self.now(), seq, request).encode()?;
        self.endpoint.send(Address::server(pid), bytes)?;
        Ok(())
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Acquire the exclusive lock on a write entry
    ///
    /// A read lease the entry still carries from an earlier read is
    /// upgraded in place when the transaction is its only holder. Once the
    /// lock is held the entry's lease is gone.
    ///
    /// After the lock is held, a newest version with a commit sequence
    /// above `begin_seq` fails the attempt with [`Error::WriteConflict`];
    /// the lock stays held and is dropped by the caller's release pass.
    ///
    /// # Errors
    /// - [`Error::LockTimeout`] when `retry` runs out
    /// - [`Error::WriteConflict`] on a first-committer-wins conflict
    /// - transport errors from the remote path
    pub fn lock(&mut self, item: &mut RwItem, owner: u64, begin_seq: u64, retry: BoundedRetry) -> Result<()> {
        if item.locked {
            return Ok(());
        }
        if self.is_local(item.pid) {
            self.lock_local(item, owner, begin_seq, retry)
        } else {
            self.lock_remote(item, owner, begin_seq, retry)
        }
    }

    fn resolve_local(&self, item: &mut RwItem) -> Result<Arc<Record>> {
        if let Some(record) = &item.record {
            return Ok(Arc::clone(record));
        }
        let (slot, record) = self.local.table(item.key.table)?.get_or_insert(item.key.key)?;
        item.slot = Some(slot as u64);
        item.record = Some(Arc::clone(&record));
        Ok(record)
    }

    fn lock_local(&mut self, item: &mut RwItem, owner: u64, begin_seq: u64, retry: BoundedRetry) -> Result<()> {
        let mut record = self.resolve_local(item)?;
        item.lock_attempted = true;
        let table = self.local.table(item.key.table)?;
        let (key, own_lease) = (item.key.key, item.lease_end);
        let (snapshots, manager) = (&self.snapshots, &self.manager);
        let mut slot = item.slot;
        let acquired = retry.run(|| {
            let now = snapshots.global_ss();
            match lease::try_lock(record.lock_word(), owner, now, own_lease) {
                LockOutcome::Acquired | LockOutcome::AlreadyHeld => {
                    if table.is_current(key, &record) {
                        return Ok(Step::Ready(()));
                    }
                    // Dropped as vacant since we looked it up
                    lease::unlock(record.lock_word(), owner);
                    let (fresh_slot, fresh) = table.get_or_insert(key)?;
                    slot = Some(fresh_slot as u64);
                    record = fresh;
                    Ok::<_, Error>(Step::Pending)
                }
                LockOutcome::HeldByOther { .. } => {
                    manager.resolve(table, key, &record);
                    Ok(Step::Pending)
                }
                LockOutcome::Leased { .. } => Ok(Step::Pending),
            }
        })?;
        item.slot = slot;
        item.record = Some(Arc::clone(&record));
        if acquired.is_none() {
            return Err(Error::LockTimeout {
                table: item.key.table,
                key: item.key.key,
            });
        }
        item.locked = true;
        item.lease_end = None;
        if record.latest_seq() > begin_seq {
            return Err(Error::WriteConflict {
                table: item.key.table,
                key: item.key.key,
            });
        }
        tracing::trace!(record = %item.key, owner, "local lock acquired");
        Ok(())
    }

    fn lock_remote(&mut self, item: &mut RwItem, owner: u64, begin_seq: u64, retry: BoundedRetry) -> Result<()> {
        item.lock_attempted = true;
        let (pid, key) = (item.pid, item.key);
        let request = Request::Lock {
            owner,
            begin_seq,
            lease: item.lease_end,
        };
        let granted = retry.run(|| {
            let now = self.now();
            match self.round_trip(pid, key.table, key.key, now, request.clone())? {
                Reply::LockGranted { slot } => Ok(Step::Ready(slot)),
                Reply::Denied(DenyReason::Locked | DenyReason::Leased) => Ok(Step::Pending),
                Reply::Denied(reason) => Err(denied(reason, key, pid)),
                other => Err(unexpected(&other, key)),
            }
        })?;
        match granted {
            Some(slot) => {
                item.slot = Some(slot);
                item.locked = true;
                item.lease_end = None;
                tracing::trace!(record = %key, partition = %pid, owner, "remote lock acquired");
                Ok(())
            }
            None => Err(Error::LockTimeout {
                table: key.table,
                key: key.key,
            }),
        }
    }

    /// Release an entry's lock, first installing `write_back` if given
    ///
    /// Without a write-back, a record that was created for this entry and
    /// never written is dropped from its table. A local entry that reserved
    /// a record but never locked it is locked briefly for that. Releasing
    /// an entry whose lock was never granted is otherwise a no-op.
    ///
    /// Remote releases are resent until the fallback deadline.
    pub fn release(&mut self, item: &mut RwItem, owner: u64, write_back: Option<&Version>) -> Result<()> {
        if self.is_local(item.pid) {
            if let Some(record) = &item.record {
                let now = self.now();
                let held = item.locked || lease::try_lock(record.lock_word(), owner, now, None) == LockOutcome::Acquired;
                if held {
                    match write_back {
                        Some(version) => record.install(version.clone()),
                        None => {
                            self.local.table(item.key.table)?.remove_vacant(item.key.key, record);
                        }
                    }
                    lease::unlock(record.lock_word(), owner);
                }
            }
            item.locked = false;
            return Ok(());
        }

        let (pid, key) = (item.pid, item.key);
        let request = Request::Release {
            owner,
            write_back: write_back.map(to_payload),
        };
        let retry = self.timing.fallback;
        let mut last = None;
        let confirmed = retry.run(|| {
            let now = self.now();
            match self.round_trip(pid, key.table, key.key, now, request.clone()) {
                Ok(Reply::Released) => Ok(Step::Ready(())),
                // The lock request never reached the server or was refused
                Ok(Reply::Denied(DenyReason::NotOwner | DenyReason::NotFound)) if write_back.is_none() => {
                    Ok(Step::Ready(()))
                }
                Ok(Reply::Denied(reason)) => Err(denied(reason, key, pid)),
                Ok(other) => Err(unexpected(&other, key)),
                Err(e) if e.is_transport() => {
                    tracing::debug!(record = %key, partition = %pid, error = %e, "release not confirmed, resending");
                    last = Some(e);
                    Ok(Step::Pending)
                }
                Err(e) => Err(e),
            }
        })?;
        if confirmed.is_none() {
            return Err(last.unwrap_or(Error::RemoteTimeout { partition: pid }));
        }
        item.locked = false;
        Ok(())
    }

    /// Release an entry's lock with its committed version
    ///
    /// A remote release that cannot be confirmed leaves the version with the
    /// stranded lock, to be installed by whoever next touches the record.
    /// Returns whether the release was confirmed.
    pub fn write_back(&mut self, item: &mut RwItem, owner: u64, version: Version) -> bool {
        match self.release(item, owner, Some(&version)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(owner, record = %item.key, partition = %item.pid, error = %e, "write-back not confirmed");
                self.manager.strand(owner, item.key, Some(version));
                item.locked = false;
                false
            }
        }
    }

    /// Release every lock `set` attempted or reserved, without writing
    ///
    /// Releases that cannot be confirmed are stranded for resolution.
    /// Returns how many were stranded.
    pub fn release_all(&mut self, set: &mut RwSet, owner: u64) -> usize {
        let mut stranded = 0;
        for n in set.to_release() {
            let item = set.at_mut(n);
            if let Err(e) = self.release(item, owner, None) {
                stranded += 1;
                tracing::warn!(owner, record = %item.key, partition = %item.pid, error = %e, "release not confirmed");
                self.manager.strand(owner, item.key, None);
                item.locked = false;
            }
            item.lock_attempted = false;
        }
        stranded
    }

    /// Give back every read lease in `set` that did not become a lock
    ///
    /// Best effort: a lease that is not given back lapses at its expiry.
    pub fn release_leases(&mut self, set: &mut RwSet) {
        let now = self.now();
        for n in 0..set.len() {
            let item = set.at_mut(n);
            let Some(end) = item.lease_end.take() else {
                continue;
            };
            if self.is_local(item.pid) {
                if let Some(record) = &item.record {
                    lease::release_lease(record.lock_word(), end, now);
                }
            } else if let Err(e) = self.notify(item.pid, item.key, Request::ReleaseLease { end }) {
                tracing::debug!(record = %item.key, partition = %item.pid, error = %e, "lease left to lapse");
            }
        }
    }

    /// Globally ordered locking
    ///
    /// Drops every lock held, then takes all write locks in ascending
    /// `(table, key)` order under one deadline. Every transaction that
    /// falls back uses the same order, so no two can wait on each other in
    /// a cycle.
    pub fn fallback_lock_all(&mut self, set: &mut RwSet, owner: u64, begin_seq: u64) -> Result<()> {
        let stranded = self.release_all(set, owner);
        if stranded > 0 {
            return Err(Error::Transport(format!(
                "{} releases not confirmed before fallback locking",
                stranded
            )));
        }
        let deadline = Instant::now() + self.timing.fallback.timeout();
        let order = set.canonical_write_order();
        tracing::debug!(owner, locks = order.len(), "fallback to ordered locking");
        for n in order {
            let retry = self.timing.fallback.until(deadline);
            self.lock(set.at_mut(n), owner, begin_seq, retry)?;
        }
        Ok(())
    }

    // =========================================================================
    // Leases and reads
    // =========================================================================

    /// Take a read lease on an entry and read the latest version
    ///
    /// Sets `item.value`, plus `item.lease_end` when the record exists. An
    /// absent key is returned without a lease.
    pub fn get_lease(&mut self, item: &mut RwItem) -> Result<()> {
        let retry = self.timing.lease;
        let epochs = self.timing.lease_epochs;
        if self.is_local(item.pid) {
            let table = self.local.table(item.key.table)?;
            let Some((slot, record)) = table.get(item.key.key) else {
                item.value = None;
                item.lease_end = None;
                return Ok(());
            };
            let (snapshots, manager) = (&self.snapshots, &self.manager);
            let end = retry.run(|| {
                let now = snapshots.global_ss();
                Ok::<_, Error>(match lease::try_lease(record.lock_word(), now + epochs, now) {
                    LeaseOutcome::Granted { end } => Step::Ready(end),
                    LeaseOutcome::Locked { .. } => {
                        manager.resolve(table, item.key.key, &record);
                        Step::Pending
                    }
                })
            })?;
            let end = end.ok_or(Error::LeaseTimeout {
                table: item.key.table,
                key: item.key.key,
            })?;
            item.slot = Some(slot as u64);
            item.value = record.read_latest().and_then(|v| v.value);
            item.record = Some(record);
            item.lease_end = Some(end);
            return Ok(());
        }

        let (pid, key) = (item.pid, item.key);
        let outcome = retry.run(|| {
            let now = self.now();
            let request = Request::LeaseRead { end: now + epochs };
            match self.round_trip(pid, key.table, key.key, now, request)? {
                Reply::LeaseGranted { end, slot, version } => {
                    Ok(Step::Ready((Some(end), slot, payload_value(version))))
                }
                Reply::Value { slot: None, .. } => Ok(Step::Ready((None, None, None))),
                Reply::Denied(DenyReason::Locked) => Ok(Step::Pending),
                Reply::Denied(reason) => Err(denied(reason, key, pid)),
                other => Err(unexpected(&other, key)),
            }
        })?;
        let (end, slot, value) = outcome.ok_or(Error::LeaseTimeout {
            table: key.table,
            key: key.key,
        })?;
        item.lease_end = end;
        item.slot = slot;
        item.value = value;
        Ok(())
    }

    /// Read the version visible at `snapshot`; no lease is taken
    pub fn snapshot_read(&mut self, item: &mut RwItem, snapshot: u64) -> Result<()> {
        if self.is_local(item.pid) {
            let table = self.local.table(item.key.table)?;
            let found = table.get(item.key.key);
            if let Some((_, record)) = &found {
                self.manager.resolve(table, item.key.key, record);
            }
            item.value = found
                .as_ref()
                .and_then(|(_, r)| r.read_at(snapshot))
                .and_then(|v| v.value);
            if let Some((slot, record)) = found {
                item.slot = Some(slot as u64);
                item.record = Some(record);
            }
            return Ok(());
        }

        let key = item.key;
        match self.round_trip(item.pid, key.table, key.key, snapshot, Request::SnapshotRead)? {
            Reply::Value { slot, version } => {
                item.slot = slot;
                item.value = payload_value(version);
                Ok(())
            }
            Reply::Denied(reason) => Err(denied(reason, key, item.pid)),
            other => Err(unexpected(&other, key)),
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check every leased read in `set` at the current SS
    ///
    /// When the SS still equals `lastsn`, the snapshot observed at Begin, no
    /// epoch boundary has been crossed and every lease taken since is still
    /// in force.
    ///
    /// # Errors
    /// [`Error::LeaseExpired`] naming the first lapsed lease
    pub fn all_leases_valid(&self, set: &RwSet, lastsn: u64) -> Result<()> {
        let now = self.now();
        if now == lastsn {
            return Ok(());
        }
        let reads = set.bucket(Bucket::LocalRead).chain(set.bucket(Bucket::RemoteRead));
        check_leases(reads, now)
    }

    /// Check only leases on the worker's own partition
    pub fn all_local_leases_valid(&self, set: &RwSet) -> Result<()> {
        check_leases(set.bucket(Bucket::LocalRead), self.now())
    }

    /// Run `f` inside the local partition's atomic region
    pub fn in_region<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        self.local
            .region()
            .execute(self.timing.region_timeout, f)
            .map_err(|_| Error::RegionAborted)
    }

    /// Remote round-trip deadline
    pub fn remote_timeout(&self) -> Duration {
        self.timing.remote_timeout
    }
}

fn check_leases<'a>(items: impl Iterator<Item = &'a RwItem>, now: u64) -> Result<()> {
    for item in items {
        if let Some(end) = item.lease_end {
            if !lease::lease_valid(end, now) {
                tracing::debug!(record = %item.key, end, now, "lease lapsed");
                return Err(Error::LeaseExpired {
                    table: item.key.table,
                    key: item.key.key,
                });
            }
        }
    }
    Ok(())
}
