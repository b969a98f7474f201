//! Partition request server
//!
//! One thread per partition answers lock, lease, read and release requests
//! from remote workers against the partition's records, using the same
//! lock-word functions as the in-process path. A record found locked by a
//! transaction that already finished is resolved through the
//! [`TransactionManager`] before the request is answered.
//!
//! Transport and decoding errors are logged and the loop carries on; the
//! server only exits when asked to.

use crate::lease::{self, LeaseOutcome, LockOutcome, LockState};
use crate::manager::TransactionManager;
use crate::snapshot::SnapshotManager;
use epochkv_core::{Error, Key, Result};
use epochkv_storage::{Partition, Table, Value, Version};
use epochkv_transport::{Body, DenyReason, Frame, Header, Payload, Reply, Request, Transport, TransportError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Request counters
#[derive(Debug, Default)]
pub struct ServerStats {
    handled: AtomicU64,
    malformed: AtomicU64,
    send_errors: AtomicU64,
}

impl ServerStats {
    /// Requests answered
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Frames that failed to decode or were not requests
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Replies that could not be sent
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Handle to a running partition server; stops and joins on drop
#[derive(Debug)]
pub struct PartitionServer {
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionServer {
    /// Start serving `partition` on `endpoint`
    ///
    /// # Arguments
    /// * `poll` - How often the loop checks for shutdown while idle
    pub fn spawn<T>(
        partition: Arc<Partition>,
        endpoint: T,
        snapshots: Arc<SnapshotManager>,
        manager: Arc<TransactionManager>,
        poll: Duration,
    ) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ServerStats::default());
        let name = format!("epochkv-server-{}", partition.id().0);
        let handle = {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(name)
                .spawn(move || serve(&partition, &endpoint, &snapshots, &manager, &stats, &stop, poll))
                .map_err(|e| Error::Internal(format!("failed to spawn partition server: {}", e)))?
        };
        Ok(Self {
            stop,
            stats,
            handle: Some(handle),
        })
    }

    /// Request counters
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Stop the loop and wait for the thread
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("partition server panicked");
            }
        }
    }
}

impl Drop for PartitionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(
    partition: &Partition,
    endpoint: &dyn Transport,
    snapshots: &SnapshotManager,
    manager: &TransactionManager,
    stats: &ServerStats,
    stop: &AtomicBool,
    poll: Duration,
) {
    tracing::info!(partition = %partition.id(), address = %endpoint.address(), "partition server started");
    while !stop.load(Ordering::Acquire) {
        let envelope = match endpoint.recv_timeout(poll) {
            Ok(env) => env,
            Err(TransportError::Timeout) => continue,
            Err(e) => {
                tracing::warn!(partition = %partition.id(), error = %e, "receive failed");
                thread::sleep(poll);
                continue;
            }
        };

        let frame = match Frame::decode(&envelope.payload) {
            Ok(Frame {
                header,
                body: Body::Request(request),
            }) => (header, request),
            Ok(_) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(from = %envelope.from, "ignoring reply sent to server");
                continue;
            }
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(from = %envelope.from, error = %e, "dropping malformed request");
                continue;
            }
        };

        let (header, request) = frame;
        let reply = handle_request(partition, manager, snapshots.global_ss(), &header, &request);
        stats.handled.fetch_add(1, Ordering::Relaxed);

        let sent = Frame::reply_to(&header, reply)
            .encode()
            .map_err(TransportError::from)
            .and_then(|bytes| endpoint.send(envelope.from, bytes));
        if let Err(e) = sent {
            stats.send_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(to = %envelope.from, seq = header.seq, error = %e, "reply not sent");
        }
    }
    tracing::info!(partition = %partition.id(), "partition server stopped");
}

fn to_payload(v: Version) -> Payload {
    Payload {
        stamp: v.stamp,
        seq: v.seq,
        value: v.value.map(|b| b.to_vec()),
    }
}

/// Answer one request against `partition` at snapshot `now`
pub fn handle_request(
    partition: &Partition,
    manager: &TransactionManager,
    now: u64,
    header: &Header,
    request: &Request,
) -> Reply {
    let Ok(table) = partition.table(header.table) else {
        return Reply::Denied(DenyReason::UnknownTable);
    };
    let key = header.key;

    match request {
        Request::SnapshotRead => match table.get(key) {
            Some((slot, record)) => {
                manager.resolve(table, key, &record);
                Reply::Value {
                    slot: Some(slot as u64),
                    version: record.read_at(header.timestamp).map(to_payload),
                }
            }
            None => Reply::Value {
                slot: None,
                version: None,
            },
        },

        Request::LeaseRead { end } => {
            let Some((slot, record)) = table.get(key) else {
                return Reply::Value {
                    slot: None,
                    version: None,
                };
            };
            let mut outcome = lease::try_lease(record.lock_word(), *end, now);
            if matches!(outcome, LeaseOutcome::Locked { .. }) && manager.resolve(table, key, &record) {
                outcome = lease::try_lease(record.lock_word(), *end, now);
            }
            match outcome {
                LeaseOutcome::Granted { end } => Reply::LeaseGranted {
                    end,
                    slot: Some(slot as u64),
                    version: record.read_latest().map(to_payload),
                },
                LeaseOutcome::Locked { .. } => Reply::Denied(DenyReason::Locked),
            }
        }

        Request::Lock {
            owner,
            begin_seq,
            lease,
        } => lock(table, manager, key, now, *owner, *begin_seq, *lease),

        Request::Release { owner, write_back } => {
            let Some((_, record)) = table.get(key) else {
                return Reply::Denied(DenyReason::NotFound);
            };
            if lease::state(record.lock_word(), now) != (LockState::Locked { owner: *owner }) {
                return Reply::Denied(DenyReason::NotOwner);
            }
            match write_back {
                Some(p) => record.install(Version {
                    stamp: p.stamp,
                    seq: p.seq,
                    value: p.value.as_deref().map(Value::from),
                }),
                None => {
                    table.remove_vacant(key, &record);
                }
            }
            lease::unlock(record.lock_word(), *owner);
            Reply::Released
        }

        Request::ReleaseLease { end } => match table.get(key) {
            Some((_, record)) => {
                lease::release_lease(record.lock_word(), *end, now);
                Reply::Released
            }
            None => Reply::Denied(DenyReason::NotFound),
        },
    }
}

fn lock(
    table: &Table,
    manager: &TransactionManager,
    key: Key,
    now: u64,
    owner: u64,
    begin_seq: u64,
    own_lease: Option<u64>,
) -> Reply {
    let Ok((slot, record)) = table.get_or_insert(key) else {
        return Reply::Denied(DenyReason::StoreFull);
    };
    let mut outcome = lease::try_lock(record.lock_word(), owner, now, own_lease);
    if matches!(outcome, LockOutcome::HeldByOther { .. }) && manager.resolve(table, key, &record) {
        outcome = lease::try_lock(record.lock_word(), owner, now, own_lease);
    }
    match outcome {
        LockOutcome::Acquired | LockOutcome::AlreadyHeld => {
            if !table.is_current(key, &record) {
                // Dropped as vacant while we waited; the requester retries
                lease::unlock(record.lock_word(), owner);
                Reply::Denied(DenyReason::Locked)
            } else if record.latest_seq() > begin_seq {
                lease::unlock(record.lock_word(), owner);
                Reply::Denied(DenyReason::Conflict)
            } else {
                Reply::LockGranted { slot: slot as u64 }
            }
        }
        LockOutcome::HeldByOther { .. } => Reply::Denied(DenyReason::Locked),
        LockOutcome::Leased { .. } => Reply::Denied(DenyReason::Leased),
    }
}
