//! Engine configuration
//!
//! Configuration is process-wide and never negotiated between partitions.
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! partitions = 2
//! workers_per_partition = 4
//! epoch_interval_ms = 20
//! backend = "hopscotch"
//!
//! [partitioner]
//! kind = "range"
//! span = 100000
//!
//! [[tables]]
//! id = 0
//! capacity = 65536
//! ```

use crate::error::{Error, Result};
use crate::types::{Key, PartitionId, TableId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Hash-index layout used by every table of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Bucketized cuckoo hashing with two hash functions
    #[default]
    Cuckoo,
    /// Hopscotch hashing with a bounded neighbourhood and overflow chains
    Hopscotch,
    /// Cluster headers of fixed-width key groups chained to indirect headers
    Cluster,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cuckoo" => Ok(BackendKind::Cuckoo),
            "hopscotch" => Ok(BackendKind::Hopscotch),
            "cluster" => Ok(BackendKind::Cluster),
            other => Err(Error::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Mapping from keys to owning partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Partitioner {
    /// `key % partitions`
    #[default]
    Modulo,
    /// Contiguous ranges of `span` keys; the last partition takes the tail
    Range {
        /// Keys per partition
        span: u64,
    },
}

impl Partitioner {
    /// Partition owning `key` in a cluster of `partitions` partitions
    pub fn partition_of(&self, key: Key, partitions: u32) -> PartitionId {
        let n = u64::from(partitions.max(1));
        let p = match *self {
            Partitioner::Modulo => key % n,
            Partitioner::Range { span } => (key / span.max(1)).min(n - 1),
        };
        PartitionId(p as u32)
    }
}

/// A table declared at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table identifier
    pub id: TableId,
    /// Record slots per partition
    pub capacity: usize,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of partitions
    pub partitions: u32,
    /// Worker threads hosted by each partition
    pub workers_per_partition: u32,
    /// Snapshot-number advance interval
    pub epoch_interval_ms: u64,
    /// Sleep granularity for bounded-retry polling
    pub poll_interval_us: u64,
    /// Grace window added to the epoch sleep
    pub lease_delta_us: u64,
    /// Read-lease length in epochs
    pub lease_epochs: u64,
    /// Deadline for optimistic lock attempts
    pub lock_timeout_ms: u64,
    /// Deadline for read-lease attempts
    pub lease_timeout_ms: u64,
    /// Deadline for the ordered fallback locking pass
    pub fallback_timeout_ms: u64,
    /// Deadline for one remote request/response round trip
    pub remote_timeout_ms: u64,
    /// Deadline for entering the local atomic region
    pub region_timeout_ms: u64,
    /// Hash-index layout
    pub backend: BackendKind,
    /// Key to partition mapping
    pub partitioner: Partitioner,
    /// Tables declared at startup
    pub tables: Vec<TableConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            workers_per_partition: 4,
            epoch_interval_ms: 20,
            poll_interval_us: 400,
            lease_delta_us: 200,
            lease_epochs: 1,
            lock_timeout_ms: 10,
            lease_timeout_ms: 10,
            fallback_timeout_ms: 100,
            remote_timeout_ms: 50,
            region_timeout_ms: 5,
            backend: BackendKind::Cuckoo,
            partitioner: Partitioner::Modulo,
            tables: vec![TableConfig {
                id: TableId(0),
                capacity: 65536,
            }],
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::Config("partitions must be at least 1".into()));
        }
        if self.workers_per_partition == 0 {
            return Err(Error::Config(
                "workers_per_partition must be at least 1".into(),
            ));
        }
        if self.epoch_interval_ms == 0 {
            return Err(Error::Config("epoch_interval_ms must be positive".into()));
        }
        if self.lease_epochs == 0 {
            return Err(Error::Config("lease_epochs must be at least 1".into()));
        }
        if self.lock_timeout_ms > self.fallback_timeout_ms {
            return Err(Error::Config(format!(
                "lock_timeout_ms ({}) exceeds fallback_timeout_ms ({})",
                self.lock_timeout_ms, self.fallback_timeout_ms
            )));
        }
        if let Partitioner::Range { span: 0 } = self.partitioner {
            return Err(Error::Config("range partitioner span must be positive".into()));
        }
        if self.tables.is_empty() {
            return Err(Error::Config("at least one table must be declared".into()));
        }
        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.capacity == 0 {
                return Err(Error::Config(format!("table {} has zero capacity", table.id)));
            }
            if !seen.insert(table.id) {
                return Err(Error::Config(format!("table {} declared twice", table.id)));
            }
        }
        Ok(())
    }

    /// Total number of worker threads across the cluster
    pub fn total_workers(&self) -> usize {
        self.partitions as usize * self.workers_per_partition as usize
    }

    /// Snapshot-number advance interval
    pub fn epoch_interval(&self) -> Duration {
        Duration::from_millis(self.epoch_interval_ms)
    }

    /// Bounded-retry sleep granularity
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Grace window added to each epoch sleep
    pub fn lease_delta(&self) -> Duration {
        Duration::from_micros(self.lease_delta_us)
    }

    /// Optimistic lock deadline
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Read-lease deadline
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Ordered fallback locking deadline
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    /// Remote round-trip deadline
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Atomic region entry deadline
    pub fn region_timeout(&self) -> Duration {
        Duration::from_millis(self.region_timeout_ms)
    }

    /// Partition owning `key`
    pub fn partition_of(&self, key: Key) -> PartitionId {
        self.partitioner.partition_of(key, self.partitions)
    }
}
