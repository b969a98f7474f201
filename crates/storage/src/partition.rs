//! A partition: one node's shard of every table
//!
//! Exposes the store interface consumed by transactions (lookup by table
//! and key, ordered key listing) plus the partition's atomic region.

use crate::record::Record;
use crate::region::AtomicRegion;
use crate::table::Table;
use epochkv_core::{BackendKind, Error, Key, PartitionId, Result, TableConfig, TableId};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One partition's tables
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    backend: BackendKind,
    tables: FxHashMap<TableId, Table>,
    region: AtomicRegion,
}

impl Partition {
    /// Create a partition with the declared tables
    pub fn new(id: PartitionId, backend: BackendKind, tables: &[TableConfig]) -> Self {
        let tables = tables
            .iter()
            .map(|&cfg| (cfg.id, Table::new(cfg, backend)))
            .collect();
        Self {
            id,
            backend,
            tables,
            region: AtomicRegion::new(),
        }
    }

    /// Partition id
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Index layout of every table
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Table by id
    pub fn table(&self, id: TableId) -> Result<&Table> {
        self.tables.get(&id).ok_or(Error::UnknownTable(id))
    }

    /// Declared table ids, ascending
    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<_> = self.tables.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Shortcut for `table(id)?.get(key)`
    pub fn get(&self, table: TableId, key: Key) -> Result<Option<(usize, Arc<Record>)>> {
        Ok(self.table(table)?.get(key))
    }

    /// The partition's atomic region
    pub fn region(&self) -> &AtomicRegion {
        &self.region
    }

    /// Prune versions in every table; returns versions removed
    pub fn collect_garbage(&self, horizon: u64) -> usize {
        let removed: usize = self.tables.values().map(|t| t.collect_garbage(horizon)).sum();
        if removed > 0 {
            tracing::debug!(partition = %self.id, horizon, removed, "pruned versions");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_table() {
        let p = Partition::new(
            PartitionId(0),
            BackendKind::Hopscotch,
            &[TableConfig {
                id: TableId(2),
                capacity: 8,
            }],
        );
        assert!(p.table(TableId(2)).is_ok());
        assert_eq!(p.table(TableId(3)).unwrap_err(), Error::UnknownTable(TableId(3)));
        assert_eq!(p.table_ids(), vec![TableId(2)]);
        assert_eq!(p.backend(), BackendKind::Hopscotch);
    }
}
