//! Storage layer for epochkv
//!
//! Per-partition in-memory store consumed by the transaction layer:
//! - [`backend`]: interchangeable hash-index layouts behind [`IndexBackend`]
//! - [`record`]: versioned records carrying a lock word
//! - [`table`] / [`partition`]: slot arenas indexed by key
//! - [`region`]: the emulated atomic region used for local write-back
//! - [`raw`]: non-transactional loader

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod hash;
pub mod partition;
pub mod raw;
pub mod record;
pub mod region;
pub mod table;

pub use backend::{new_index, ClusterIndex, CuckooIndex, HopscotchIndex, IndexBackend, IndexFull};
pub use partition::Partition;
pub use raw::RawTx;
pub use record::{Record, Value, Version};
pub use region::{AtomicRegion, RegionAborted, RegionStats};
pub use table::Table;
