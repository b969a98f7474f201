//! Core types for epochkv
//!
//! This crate defines the foundational vocabulary shared by every layer:
//! - [`types`]: table, key, partition and address identifiers
//! - [`error`]: the crate-wide [`Error`] and [`Result`]
//! - [`config`]: engine configuration loaded from TOML

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackendKind, EngineConfig, Partitioner, TableConfig};
pub use error::{Error, Result};
pub use types::{Address, Key, NodeId, PartitionId, RecordKey, TableId, ThreadId};
