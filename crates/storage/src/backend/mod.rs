//! Hash-index backends
//!
//! A backend maps a record key to the slot holding the record in its
//! table's arena. Three layouts implement the same [`IndexBackend`]
//! contract and are chosen once, when a table is created:
//!
//! - [`CuckooIndex`]: 4-way buckets, two hash functions, displacement paths
//! - [`HopscotchIndex`]: 8-bucket neighbourhoods plus overflow chains
//! - [`ClusterIndex`]: 8-key cluster headers linked to indirect headers
//!
//! Nothing above this module branches on the layout.

mod cluster;
mod cuckoo;
mod hopscotch;

pub use cluster::ClusterIndex;
pub use cuckoo::CuckooIndex;
pub use hopscotch::HopscotchIndex;

use epochkv_core::{BackendKind, Key};
use std::fmt;
use thiserror::Error;

/// The index could not place a new key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("index full: no slot for key {key}")]
pub struct IndexFull {
    /// Key that could not be placed
    pub key: Key,
}

/// Key to slot index over one table
pub trait IndexBackend: Send + Sync + fmt::Debug {
    /// Layout of this index
    fn kind(&self) -> BackendKind;

    /// Slot of `key`, if present
    fn get(&self, key: Key) -> Option<usize>;

    /// Map `key` to `slot`, replacing any previous mapping
    fn insert(&mut self, key: Key, slot: usize) -> Result<(), IndexFull>;

    /// Remove `key`, returning its slot
    fn delete(&mut self, key: Key) -> Option<usize>;

    /// Number of keys
    fn len(&self) -> usize;

    /// Whether the index holds no keys
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All `(key, slot)` pairs in unspecified order
    fn entries(&self) -> Vec<(Key, usize)>;
}

/// Build an empty index of the given layout sized for `capacity` keys
pub fn new_index(kind: BackendKind, capacity: usize) -> Box<dyn IndexBackend> {
    match kind {
        BackendKind::Cuckoo => Box::new(CuckooIndex::with_capacity(capacity)),
        BackendKind::Hopscotch => Box::new(HopscotchIndex::with_capacity(capacity)),
        BackendKind::Cluster => Box::new(ClusterIndex::with_capacity(capacity)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const KINDS: [BackendKind; 3] = [
        BackendKind::Cuckoo,
        BackendKind::Hopscotch,
        BackendKind::Cluster,
    ];

    #[test]
    fn test_insert_get_delete_all_backends() {
        for kind in KINDS {
            let mut index = new_index(kind, 64);
            assert_eq!(index.kind(), kind);
            assert!(index.is_empty());

            for key in 0..40u64 {
                index.insert(key * 7919, key as usize).unwrap();
            }
            assert_eq!(index.len(), 40, "{:?}", kind);
            for key in 0..40u64 {
                assert_eq!(index.get(key * 7919), Some(key as usize), "{:?}", kind);
            }
            assert_eq!(index.get(1), None);

            assert_eq!(index.delete(7919), Some(1));
            assert_eq!(index.delete(7919), None);
            assert_eq!(index.get(7919), None);
            assert_eq!(index.len(), 39);

            index.insert(0, 99).unwrap();
            assert_eq!(index.get(0), Some(99));
            assert_eq!(index.len(), 39);
        }
    }

    #[test]
    fn test_entries_lists_every_key() {
        for kind in KINDS {
            let mut index = new_index(kind, 32);
            for key in 100..120u64 {
                index.insert(key, (key - 100) as usize).unwrap();
            }
            let mut entries = index.entries();
            entries.sort();
            let expected: Vec<_> = (100..120u64).map(|k| (k, (k - 100) as usize)).collect();
            assert_eq!(entries, expected, "{:?}", kind);
        }
    }

    #[test]
    fn test_full_index_reports_error() {
        for kind in KINDS {
            let mut index = new_index(kind, 8);
            let mut placed = 0usize;
            let mut failed = None;
            for key in 0..10_000u64 {
                match index.insert(key, key as usize) {
                    Ok(()) => placed += 1,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            let err = failed.unwrap_or_else(|| panic!("{:?} never filled", kind));
            assert_eq!(index.len(), placed);
            assert!(index.get(err.key).is_none());
            // Everything placed before the failure is still reachable
            for key in 0..placed as u64 {
                assert_eq!(index.get(key), Some(key as usize), "{:?}", kind);
            }
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u64, usize),
        Delete(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..96, 0usize..1000).prop_map(|(k, s)| Op::Insert(k, s)),
            (0u64..96).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_backends_match_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            for kind in KINDS {
                let mut index = new_index(kind, 256);
                let mut model: HashMap<u64, usize> = HashMap::new();
                for op in &ops {
                    match *op {
                        Op::Insert(k, s) => {
                            if index.insert(k, s).is_ok() {
                                model.insert(k, s);
                            }
                        }
                        Op::Delete(k) => {
                            prop_assert_eq!(index.delete(k), model.remove(&k));
                        }
                    }
                }
                prop_assert_eq!(index.len(), model.len());
                for (k, s) in &model {
                    prop_assert_eq!(index.get(*k), Some(*s));
                }
            }
        }
    }
}
