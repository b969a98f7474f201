//! Cluster entry point for epochkv.
//!
//! A [`Cluster`] wires one in-process partition per configured partition
//! id: its store, its request server on the in-process network, the shared
//! snapshot manager and (unless epochs are manual) the epoch ticker.
//! Workers are handed out per partition and run transactions.

use crate::error::Result;
use epochkv_concurrency::{
    ClusterContext, EpochStats, EpochTicker, PartitionServer, TransactionMetrics, Worker,
};
use epochkv_core::{Address, BackendKind, EngineConfig, Key, PartitionId, TableConfig, TableId};
use epochkv_storage::{RawTx, Value};
use epochkv_transport::InProcNetwork;
use std::path::Path;
use std::sync::Arc;

/// A running in-process cluster.
///
/// # Example
///
/// ```ignore
/// use epochkv::prelude::*;
///
/// let cluster = Cluster::builder().partitions(2).build()?;
/// let mut worker = cluster.worker(PartitionId(0), 0)?;
///
/// let mut txn = worker.begin(false)?;
/// txn.add(TableId(0), 5, b"A".to_vec())?;
/// let info = txn.end()?;
///
/// worker.wait_visible(&info);
/// let mut ro = worker.begin(true)?;
/// assert_eq!(ro.get(TableId(0), 5)?.as_deref(), Some(&b"A"[..]));
/// ```
pub struct Cluster {
    ctx: Arc<ClusterContext>,
    network: InProcNetwork,
    servers: Vec<PartitionServer>,
    ticker: Option<EpochTicker>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("partitions", &self.ctx.partitions().len())
            .field("global_ss", &self.global_ss())
            .field("manual_epochs", &self.ticker.is_none())
            .finish()
    }
}

impl Cluster {
    /// Create a builder for cluster configuration.
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    /// Start a cluster from a TOML configuration file.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder()
            .config(EngineConfig::from_file(path)?)
            .build()
    }

    /// Shared state: configuration, partitions, snapshot manager.
    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        self.ctx.config()
    }

    /// The in-process network the servers and workers talk over.
    pub fn network(&self) -> &InProcNetwork {
        &self.network
    }

    /// Register worker `index` of partition `pid`.
    ///
    /// Each (partition, index) pair can be held by one worker at a time.
    pub fn worker(&self, pid: PartitionId, index: u32) -> Result<Worker> {
        let endpoint = self.network.endpoint(Address::worker(pid, index))?;
        Ok(Worker::new(Arc::clone(&self.ctx), pid, index, Box::new(endpoint))?)
    }

    /// Register every configured worker, partition by partition.
    pub fn workers(&self) -> Result<Vec<Worker>> {
        let config = self.ctx.config();
        let mut workers = Vec::with_capacity(config.total_workers());
        for p in 0..config.partitions {
            for i in 0..config.workers_per_partition {
                workers.push(self.worker(PartitionId(p), i)?);
            }
        }
        Ok(workers)
    }

    /// Current global SS.
    pub fn global_ss(&self) -> u64 {
        self.ctx.snapshots().global_ss()
    }

    /// Current safe read snapshot, `None` while no worker is registered.
    pub fn safe_read_ss(&self) -> Option<u64> {
        self.ctx.snapshots().compute_safe_read_ss()
    }

    /// Advance the global SS by one epoch and return it.
    ///
    /// Meant for clusters built with
    /// [`manual_epochs`](ClusterBuilder::manual_epochs).
    pub fn advance_epoch(&self) -> u64 {
        self.ctx.snapshots().advance()
    }

    /// Non-transactional access to one partition's store, for bulk loading.
    pub fn loader(&self, pid: PartitionId) -> Result<RawTx<'_>> {
        Ok(RawTx::new(self.ctx.partition(pid)?))
    }

    /// Load `key` into the partition that owns it, outside any transaction.
    ///
    /// Loaded values are visible at every snapshot. Not to be mixed with
    /// running transactions.
    pub fn load(&self, table: TableId, key: Key, value: impl Into<Value>) -> Result<()> {
        let pid = self.ctx.partition_of(key);
        self.loader(pid)?.put(table, key, value)?;
        Ok(())
    }

    /// Partition owning `key`.
    pub fn partition_of(&self, key: Key) -> PartitionId {
        self.ctx.partition_of(key)
    }

    /// Prune versions no running or future snapshot can read.
    ///
    /// Returns the number of versions removed.
    pub fn collect_garbage(&self) -> usize {
        let Some(horizon) = self.ctx.snapshots().gc_horizon() else {
            return 0;
        };
        let pruned = self
            .ctx
            .partitions()
            .iter()
            .map(|p| p.collect_garbage(horizon))
            .sum();
        tracing::debug!(horizon, pruned, "garbage collected");
        pruned
    }

    /// Transaction counters.
    pub fn metrics(&self) -> TransactionMetrics {
        self.ctx.manager().metrics()
    }

    /// Locks left by finished transactions and not yet resolved.
    pub fn stranded_locks(&self) -> usize {
        self.ctx.manager().stranded_locks()
    }

    /// Epoch timing observed by the ticker.
    pub fn epoch_stats(&self) -> EpochStats {
        self.ctx.snapshots().epoch_stats()
    }

    /// Requests answered by all partition servers.
    pub fn requests_served(&self) -> u64 {
        self.servers.iter().map(|s| s.stats().handled()).sum()
    }

    /// Cut partition `pid`'s request server off the network.
    pub fn sever_partition(&self, pid: PartitionId) {
        tracing::warn!(partition = %pid, "partition severed");
        self.network.sever(Address::server(pid));
    }

    /// Reconnect a severed partition.
    pub fn heal_partition(&self, pid: PartitionId) {
        tracing::info!(partition = %pid, "partition healed");
        self.network.heal(Address::server(pid));
    }

    /// Stop the ticker and the servers.
    ///
    /// Dropping the cluster does the same.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
        for server in &mut self.servers {
            server.shutdown();
        }
        if !self.servers.is_empty() {
            tracing::info!(ss = self.global_ss(), "cluster stopped");
        }
        self.servers.clear();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builder for cluster configuration.
///
/// # Example
///
/// ```ignore
/// // Deterministic tests: epochs advance only when asked
/// let cluster = Cluster::builder()
///     .partitions(2)
///     .workers_per_partition(2)
///     .backend(BackendKind::Hopscotch)
///     .table(TableId(1), 1024)
///     .manual_epochs()
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClusterBuilder {
    config: EngineConfig,
    manual_epochs: bool,
}

impl ClusterBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `config`, replacing everything set so far.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of partitions.
    pub fn partitions(mut self, n: u32) -> Self {
        self.config.partitions = n;
        self
    }

    /// Worker threads per partition.
    pub fn workers_per_partition(mut self, n: u32) -> Self {
        self.config.workers_per_partition = n;
        self
    }

    /// Index layout for every table.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = kind;
        self
    }

    /// Declare table `id` with `capacity` records per partition.
    ///
    /// Redeclaring an id replaces its capacity.
    pub fn table(mut self, id: TableId, capacity: usize) -> Self {
        match self.config.tables.iter_mut().find(|t| t.id == id) {
            Some(t) => t.capacity = capacity,
            None => self.config.tables.push(TableConfig { id, capacity }),
        }
        self
    }

    /// Do not start the epoch ticker; advance with
    /// [`Cluster::advance_epoch`].
    pub fn manual_epochs(mut self) -> Self {
        self.manual_epochs = true;
        self
    }

    /// Validate the configuration and start the cluster.
    pub fn build(self) -> Result<Cluster> {
        let ctx = Arc::new(ClusterContext::new(self.config)?);
        let config = ctx.config();
        let network = InProcNetwork::new();

        let mut servers = Vec::with_capacity(ctx.partitions().len());
        for partition in ctx.partitions() {
            let endpoint = network.endpoint(Address::server(partition.id()))?;
            servers.push(PartitionServer::spawn(
                Arc::clone(partition),
                endpoint,
                Arc::clone(ctx.snapshots()),
                Arc::clone(ctx.manager()),
                config.poll_interval(),
            )?);
        }

        let ticker = if self.manual_epochs {
            None
        } else {
            Some(EpochTicker::start(
                Arc::clone(ctx.snapshots()),
                config.epoch_interval(),
                config.lease_delta(),
            )?)
        };

        tracing::info!(
            partitions = config.partitions,
            workers = config.total_workers(),
            backend = ?config.backend,
            manual_epochs = self.manual_epochs,
            "cluster started"
        );
        Ok(Cluster {
            ctx,
            network,
            servers,
            ticker,
        })
    }
}

impl From<EngineConfig> for ClusterBuilder {
    fn from(config: EngineConfig) -> Self {
        Self::new().config(config)
    }
}
