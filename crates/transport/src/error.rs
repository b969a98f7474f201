//! Transport errors

use crate::frame::FrameError;
use epochkv_core::Address;
use thiserror::Error;

/// Messaging channel failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No endpoint registered at the address
    #[error("no endpoint at {0}")]
    UnknownPeer(Address),

    /// The link to or from the address is down
    #[error("link to {0} is down")]
    Disconnected(Address),

    /// An endpoint already owns the address
    #[error("address {0} already in use")]
    AddressInUse(Address),

    /// Nothing arrived before the deadline
    #[error("receive timed out")]
    Timeout,

    /// A frame could not be encoded or decoded
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<TransportError> for epochkv_core::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Frame(f) => epochkv_core::Error::Codec(f.to_string()),
            other => epochkv_core::Error::Transport(other.to_string()),
        }
    }
}

impl From<FrameError> for epochkv_core::Error {
    fn from(e: FrameError) -> Self {
        epochkv_core::Error::Codec(e.to_string())
    }
}
