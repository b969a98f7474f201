//! State shared by every worker and server of a cluster

use crate::backoff::BoundedRetry;
use crate::manager::TransactionManager;
use crate::snapshot::SnapshotManager;
use epochkv_core::{EngineConfig, Error, Key, PartitionId, Result, ThreadId};
use epochkv_storage::Partition;
use std::sync::Arc;
use std::time::Duration;

/// Deadlines and lease length derived from the configuration
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Optimistic per-item lock attempts
    pub lock: BoundedRetry,
    /// Read lease attempts
    pub lease: BoundedRetry,
    /// The whole ordered fallback pass
    pub fallback: BoundedRetry,
    /// One remote round trip
    pub remote_timeout: Duration,
    /// Entering the local atomic region
    pub region_timeout: Duration,
    /// Lease length in epochs
    pub lease_epochs: u64,
    /// Sleep granularity
    pub poll: Duration,
}

impl Timing {
    /// Derive from a configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        let poll = config.poll_interval();
        Self {
            lock: BoundedRetry::new(config.lock_timeout(), poll),
            lease: BoundedRetry::new(config.lease_timeout(), poll),
            fallback: BoundedRetry::new(config.fallback_timeout(), poll),
            remote_timeout: config.remote_timeout(),
            region_timeout: config.region_timeout(),
            lease_epochs: config.lease_epochs,
            poll,
        }
    }
}

/// Configuration, partitions, snapshot manager and transaction manager
#[derive(Debug)]
pub struct ClusterContext {
    config: EngineConfig,
    timing: Timing,
    snapshots: Arc<SnapshotManager>,
    manager: Arc<TransactionManager>,
    partitions: Vec<Arc<Partition>>,
}

impl ClusterContext {
    /// Validate `config` and build empty partitions
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let partitions = (0..config.partitions)
            .map(|p| Arc::new(Partition::new(PartitionId(p), config.backend, &config.tables)))
            .collect();
        Ok(Self {
            timing: Timing::from_config(&config),
            snapshots: Arc::new(SnapshotManager::new(config.total_workers())),
            manager: Arc::new(TransactionManager::new()),
            partitions,
            config,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Derived deadlines
    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Snapshot manager
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Transaction manager
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Partition by id
    pub fn partition(&self, pid: PartitionId) -> Result<&Arc<Partition>> {
        self.partitions
            .get(pid.index())
            .ok_or(Error::UnknownPartition(pid))
    }

    /// All partitions
    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    /// Partition owning `key`
    pub fn partition_of(&self, key: Key) -> PartitionId {
        self.config.partition_of(key)
    }

    /// Snapshot-manager slot of worker `index` on `pid`
    pub fn thread_id(&self, pid: PartitionId, index: u32) -> ThreadId {
        pid.index() * self.config.workers_per_partition as usize + index as usize
    }
}
