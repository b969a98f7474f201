//! Messaging channel for epochkv
//!
//! Partitions exchange lock, lease, read and release requests over an
//! addressed, point-to-point channel:
//! - [`Transport`]: send/receive contract addressed by `(partition, node)`
//! - [`InProcNetwork`]: in-process implementation over crossbeam channels
//! - [`frame`]: the request/response wire format
//!
//! Every failure is returned to the caller. Nothing in this crate
//! terminates the process.

#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod inproc;

pub use error::TransportError;
pub use frame::{Body, DenyReason, Frame, FrameError, Header, Op, Payload, Reply, Request};
pub use inproc::{InProcEndpoint, InProcNetwork};

use epochkv_core::Address;
use std::time::Duration;

/// A received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender address
    pub from: Address,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Addressed send/receive endpoint
///
/// `send` is fire-and-forget; request/response pairing is built on top by
/// matching sequence numbers carried in the payload.
pub trait Transport: Send {
    /// This endpoint's address
    fn address(&self) -> Address;

    /// Queue `payload` for `to`
    fn send(&self, to: Address, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Block until a message arrives
    fn recv(&self) -> Result<Envelope, TransportError>;

    /// Block until a message arrives or `timeout` passes
    fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, TransportError>;

    /// Take a queued message without blocking
    fn try_recv(&self) -> Result<Option<Envelope>, TransportError>;
}
