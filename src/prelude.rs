//! Convenient imports for epochkv.
//!
//! ```ignore
//! use epochkv::prelude::*;
//!
//! let cluster = Cluster::builder().build()?;
//! let mut worker = cluster.worker(PartitionId(0), 0)?;
//! ```

// Main entry point
pub use crate::cluster::{Cluster, ClusterBuilder};

// Error handling
pub use crate::error::{Error, Result};

// Transactions
pub use crate::{CommitInfo, Transaction, TransactionStatus, TxIterator, Worker};

// Core types
pub use crate::{BackendKind, EngineConfig, Key, PartitionId, RecordKey, TableId, Value};
