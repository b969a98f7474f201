//! Error types for epochkv
//!
//! Errors fall into four families, each with its own recovery policy:
//! - **Contention** (lock/lease timeout, lease invalidated, write conflict):
//!   the transaction aborts and the caller may retry it as a whole
//! - **Misuse** (write on a read-only transaction, call on a finished
//!   transaction, unregistered thread): a programming error, never retried
//! - **Transport** (send/receive failure, remote timeout): the affected
//!   transaction aborts and the failure is surfaced
//! - **Resource** (index full): the write path aborts before any partial
//!   record becomes visible

use crate::types::{Key, PartitionId, TableId, ThreadId};
use thiserror::Error;

/// Result type alias for epochkv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for epochkv operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Exclusive lock could not be acquired before the deadline
    #[error("lock timeout on {table}:{key}")]
    LockTimeout {
        /// Table of the contended record
        table: TableId,
        /// Key of the contended record
        key: Key,
    },

    /// Read lease could not be acquired before the deadline
    #[error("lease timeout on {table}:{key}")]
    LeaseTimeout {
        /// Table of the contended record
        table: TableId,
        /// Key of the contended record
        key: Key,
    },

    /// A lease expired or was invalidated before commit validation
    #[error("lease on {table}:{key} no longer valid")]
    LeaseExpired {
        /// Table of the invalidated read
        table: TableId,
        /// Key of the invalidated read
        key: Key,
    },

    /// Another transaction committed a newer version first
    #[error("write conflict on {table}:{key}")]
    WriteConflict {
        /// Table of the conflicting record
        table: TableId,
        /// Key of the conflicting record
        key: Key,
    },

    /// Write issued on a transaction begun as read-only
    #[error("transaction is read-only")]
    ReadOnlyViolation,

    /// Operation issued on a transaction that is not active
    #[error("transaction not active: {0}")]
    NotActive(String),

    /// Table id was never declared
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    /// Partition id outside the cluster
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    /// The table's hash index has no free slot for the key
    #[error("store full: table {table} cannot hold key {key}")]
    StoreFull {
        /// Table that ran out of slots
        table: TableId,
        /// Key that could not be placed
        key: Key,
    },

    /// Thread id has no slot in the snapshot manager
    #[error("thread {0} not registered")]
    ThreadNotRegistered(ThreadId),

    /// Messaging channel failure
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply from a remote partition before the deadline
    #[error("remote partition {partition} did not reply in time")]
    RemoteTimeout {
        /// Partition that did not reply
        partition: PartitionId,
    },

    /// Malformed message frame
    #[error("codec error: {0}")]
    Codec(String),

    /// The local atomic region could not be entered
    #[error("atomic region aborted")]
    RegionAborted,

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),

    /// Internal error (bug or invariant violation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Contention failures: the whole transaction may succeed on retry
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::LeaseTimeout { .. }
                | Error::LeaseExpired { .. }
                | Error::WriteConflict { .. }
                | Error::RegionAborted
        )
    }

    /// Programming errors on the caller's side
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::ReadOnlyViolation
                | Error::NotActive(_)
                | Error::UnknownTable(_)
                | Error::UnknownPartition(_)
                | Error::ThreadNotRegistered(_)
        )
    }

    /// Messaging channel failures
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RemoteTimeout { .. } | Error::Codec(_)
        )
    }

    /// Check if this error is retryable
    ///
    /// Contention and transport errors leave no state behind, so the
    /// transaction can be re-run from Begin.
    pub fn is_retryable(&self) -> bool {
        self.is_contention() || self.is_transport()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let lock = Error::LockTimeout {
            table: TableId(0),
            key: 5,
        };
        assert!(lock.is_contention());
        assert!(lock.is_retryable());
        assert!(!lock.is_misuse());

        assert!(Error::ReadOnlyViolation.is_misuse());
        assert!(!Error::ReadOnlyViolation.is_retryable());

        let remote = Error::RemoteTimeout {
            partition: PartitionId(1),
        };
        assert!(remote.is_transport());
        assert!(remote.is_retryable());

        let full = Error::StoreFull {
            table: TableId(0),
            key: 1,
        };
        assert!(!full.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = Error::WriteConflict {
            table: TableId(2),
            key: 7,
        };
        assert_eq!(e.to_string(), "write conflict on t2:7");
        assert_eq!(Error::RegionAborted.to_string(), "atomic region aborted");
    }
}
