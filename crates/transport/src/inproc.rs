//! In-process messaging over crossbeam channels
//!
//! Every endpoint owns an unbounded queue registered under its address in a
//! shared [`DashMap`]. Links can be severed and healed per address to inject
//! transport failures: while an address is severed, sends to it and sends
//! from it fail with [`TransportError::Disconnected`].

use crate::{Envelope, Transport, TransportError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::{DashMap, DashSet};
use epochkv_core::Address;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Registry {
    endpoints: DashMap<Address, Sender<Envelope>>,
    severed: DashSet<Address>,
}

/// Shared in-process network
#[derive(Debug, Clone, Default)]
pub struct InProcNetwork {
    registry: Arc<Registry>,
}

impl InProcNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint at `address`
    ///
    /// # Errors
    ///
    /// [`TransportError::AddressInUse`] if another live endpoint owns it.
    pub fn endpoint(&self, address: Address) -> Result<InProcEndpoint, TransportError> {
        let (tx, rx) = unbounded();
        match self.registry.endpoints.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::AddressInUse(address))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
            }
        }
        Ok(InProcEndpoint {
            address,
            rx,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Fail every send to or from `address` until healed
    pub fn sever(&self, address: Address) {
        tracing::warn!(%address, "link severed");
        self.registry.severed.insert(address);
    }

    /// Undo [`sever`](Self::sever)
    pub fn heal(&self, address: Address) {
        self.registry.severed.remove(&address);
    }

    /// Whether an endpoint is registered at `address`
    pub fn is_registered(&self, address: Address) -> bool {
        self.registry.endpoints.contains_key(&address)
    }
}

/// One registered endpoint; deregisters on drop
#[derive(Debug)]
pub struct InProcEndpoint {
    address: Address,
    rx: Receiver<Envelope>,
    registry: Arc<Registry>,
}

impl InProcEndpoint {
    fn check_link(&self, to: Address) -> Result<(), TransportError> {
        if self.registry.severed.contains(&self.address) {
            return Err(TransportError::Disconnected(self.address));
        }
        if self.registry.severed.contains(&to) {
            return Err(TransportError::Disconnected(to));
        }
        Ok(())
    }
}

impl Transport for InProcEndpoint {
    fn address(&self) -> Address {
        self.address
    }

    fn send(&self, to: Address, payload: Vec<u8>) -> Result<(), TransportError> {
        self.check_link(to)?;
        let sender = self
            .registry
            .endpoints
            .get(&to)
            .map(|s| s.clone())
            .ok_or(TransportError::UnknownPeer(to))?;
        sender
            .send(Envelope {
                from: self.address,
                payload,
            })
            .map_err(|_| TransportError::Disconnected(to))
    }

    fn recv(&self) -> Result<Envelope, TransportError> {
        self.rx
            .recv()
            .map_err(|_| TransportError::Disconnected(self.address))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, TransportError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::Timeout,
            RecvTimeoutError::Disconnected => TransportError::Disconnected(self.address),
        })
    }

    fn try_recv(&self) -> Result<Option<Envelope>, TransportError> {
        match self.rx.try_recv() {
            Ok(env) => Ok(Some(env)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected(self.address)),
        }
    }
}

impl Drop for InProcEndpoint {
    fn drop(&mut self) {
        self.registry.endpoints.remove(&self.address);
    }
}
