//! # epochkv
//!
//! Partitioned in-memory key-value store with snapshot-isolation
//! transactions.
//!
//! A global snapshot number (SS) advances once per epoch. Read-only
//! transactions read at the safe snapshot, below every in-flight writer,
//! and never validate. Read-write transactions read under epoch-bounded
//! read leases, lock their write-set at commit, validate the leases and
//! install their writes stamped with the commit SS.
//!
//! ## Quick Start
//!
//! ```ignore
//! use epochkv::prelude::*;
//!
//! let cluster = Cluster::builder().partitions(2).build()?;
//! let mut workers = cluster.workers()?;
//!
//! workers[0].run(false, 8, |txn| {
//!     txn.add(TableId(0), 5, b"A".to_vec())
//! })?;
//! ```
//!
//! ## Crates
//!
//! - `epochkv-core`: ids, errors, configuration
//! - `epochkv-storage`: versioned records, hash-index backends, partitions
//! - `epochkv-transport`: messaging channel and frame codec
//! - `epochkv-concurrency`: snapshot manager, lock/lease protocol,
//!   transaction coordinator

#![warn(missing_docs)]

mod cluster;
mod error;

pub mod prelude;

// Re-export main entry points
pub use cluster::{Cluster, ClusterBuilder};
pub use error::{Error, Result};

// Re-export the transaction API
pub use epochkv_concurrency::{
    CommitInfo, EpochStats, Transaction, TransactionMetrics, TransactionStatus, TxIterator, Worker,
};

// Re-export types
pub use epochkv_core::{
    Address, BackendKind, EngineConfig, Key, NodeId, PartitionId, Partitioner, RecordKey,
    TableConfig, TableId, ThreadId,
};
pub use epochkv_storage::{RawTx, Value};

/// Engine error type returned by workers and transactions
pub use epochkv_core::Error as EngineError;
