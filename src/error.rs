//! Unified error types for epochkv.
//!
//! The facade collapses the engine's detailed error enum into the
//! categories a caller acts on: retry, fix the call, or give up.

use thiserror::Error;

/// All epochkv errors.
///
/// This is the error type returned by [`Cluster`](crate::Cluster)
/// operations. Engine errors from workers and transactions convert into it
/// with `?`.
#[derive(Debug, Error)]
pub enum Error {
    /// Contention: lock or lease timeout, lapsed lease, write conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Messaging channel failure or remote timeout
    #[error("transport error: {0}")]
    Transport(String),

    /// Programming misuse (write in a read-only transaction, unknown table, ...)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A partition's index has no room for the key
    #[error("store full: {0}")]
    StoreFull(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (bug or invariant violation)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for epochkv operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Conflicts and transport failures abort the transaction cleanly; a
    /// fresh attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Transport(_))
    }

    /// Check if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this is a serious/unrecoverable error.
    pub fn is_serious(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

// Convert from engine errors
impl From<epochkv_core::Error> for Error {
    fn from(e: epochkv_core::Error) -> Self {
        use epochkv_core::Error as CoreError;
        match e {
            CoreError::StoreFull { .. } => Error::StoreFull(e.to_string()),
            CoreError::Config(msg) => Error::Config(msg),
            CoreError::Internal(msg) => Error::Internal(msg),
            e if e.is_contention() => Error::Conflict(e.to_string()),
            e if e.is_transport() => Error::Transport(e.to_string()),
            e if e.is_misuse() => Error::InvalidOperation(e.to_string()),
            e => Error::Internal(e.to_string()),
        }
    }
}

impl From<epochkv_transport::TransportError> for Error {
    fn from(e: epochkv_transport::TransportError) -> Self {
        epochkv_core::Error::from(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochkv_core::{Error as CoreError, TableId};

    #[test]
    fn test_core_error_mapping() {
        let conflict: Error = CoreError::WriteConflict {
            table: TableId(0),
            key: 1,
        }
        .into();
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());

        let misuse: Error = CoreError::ReadOnlyViolation.into();
        assert!(matches!(misuse, Error::InvalidOperation(_)));
        assert!(!misuse.is_retryable());

        let remote: Error = CoreError::RemoteTimeout {
            partition: epochkv_core::PartitionId(1),
        }
        .into();
        assert!(matches!(remote, Error::Transport(_)));

        let broken: Error = CoreError::Internal("lost lock".into()).into();
        assert!(broken.is_serious());
        assert_eq!(broken.to_string(), "internal error: lost lock");
    }
}
