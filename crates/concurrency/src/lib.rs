//! Concurrency layer for epochkv
//!
//! This crate implements snapshot-isolation transactions over partitioned
//! in-memory stores:
//! - SnapshotManager: global epoch SS, per-thread watermarks, safe read snapshot
//! - Lock/lease protocol: exclusive locks and epoch-bounded read leases
//! - PartitionServer: serves lock/lease/read/release requests for remote workers
//! - Worker/Transaction: the transaction coordinator

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod context;
pub mod iterator;
pub mod lease;
pub mod manager;
pub mod protocol;
pub mod rwset;
pub mod server;
pub mod snapshot;
pub mod transaction;

pub use backoff::{Backoff, BoundedRetry, Step};
pub use context::{ClusterContext, Timing};
pub use iterator::TxIterator;
pub use lease::{LeaseOutcome, LockOutcome, LockState};
pub use manager::{TransactionManager, TransactionMetrics};
pub use protocol::Protocol;
pub use rwset::{Bucket, RwItem, RwSet};
pub use server::{handle_request, PartitionServer, ServerStats};
pub use snapshot::{EpochStats, EpochTicker, SnapshotManager};
pub use transaction::{CommitInfo, Transaction, TransactionStatus, Worker};
