//! Bucketized cuckoo hashing
//!
//! Each key has two candidate buckets of [`SLOTS_PER_BUCKET`] entries:
//! `murmur(key) % buckets` and `key % buckets`. When both are full, a
//! breadth-first search looks for a chain of displacements ending in a
//! free entry; the chain is then shifted one step so the new key fits in
//! one of its own buckets. The search is bounded by [`MAX_KICKS`] visited
//! buckets, so a failed insert leaves the index unchanged.

use super::{IndexBackend, IndexFull};
use crate::hash::hash_key;
use epochkv_core::{BackendKind, Key};
use std::collections::VecDeque;

/// Entries per bucket
pub const SLOTS_PER_BUCKET: usize = 4;

/// Upper bound on buckets visited by a displacement search
pub const MAX_KICKS: usize = 500;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Key,
    slot: usize,
}

type Bucket = [Option<Entry>; SLOTS_PER_BUCKET];

/// Node of the displacement search tree
struct PathNode {
    bucket: usize,
    parent: Option<usize>,
    /// Entry of the parent bucket that would move into this bucket
    via: usize,
}

/// Cuckoo hash index
#[derive(Debug)]
pub struct CuckooIndex {
    buckets: Vec<Bucket>,
    len: usize,
}

impl CuckooIndex {
    /// Create an index with room for about `capacity` keys
    pub fn with_capacity(capacity: usize) -> Self {
        let count = ((capacity + SLOTS_PER_BUCKET - 1) / SLOTS_PER_BUCKET).max(1);
        Self {
            buckets: vec![[None; SLOTS_PER_BUCKET]; count],
            len: 0,
        }
    }

    fn primary(&self, key: Key) -> usize {
        (hash_key(key) % self.buckets.len() as u64) as usize
    }

    fn secondary(&self, key: Key) -> usize {
        (key % self.buckets.len() as u64) as usize
    }

    fn alternate(&self, key: Key, bucket: usize) -> usize {
        let p = self.primary(key);
        if p == bucket {
            self.secondary(key)
        } else {
            p
        }
    }

    fn locate(&self, key: Key) -> Option<(usize, usize)> {
        for bucket in [self.primary(key), self.secondary(key)] {
            for (i, entry) in self.buckets[bucket].iter().enumerate() {
                if matches!(entry, Some(e) if e.key == key) {
                    return Some((bucket, i));
                }
            }
        }
        None
    }

    fn free_entry(&self, bucket: usize) -> Option<usize> {
        self.buckets[bucket].iter().position(Option::is_none)
    }

    /// Search for a displacement chain; returns the index of the node
    /// whose bucket has a free entry, plus that entry
    fn find_path(&self, key: Key, nodes: &mut Vec<PathNode>) -> Option<(usize, usize)> {
        let mut queue = VecDeque::new();
        for bucket in [self.primary(key), self.secondary(key)] {
            nodes.push(PathNode {
                bucket,
                parent: None,
                via: 0,
            });
            queue.push_back(nodes.len() - 1);
        }

        while let Some(n) = queue.pop_front() {
            let bucket = nodes[n].bucket;
            if let Some(free) = self.free_entry(bucket) {
                return Some((n, free));
            }
            if nodes.len() >= MAX_KICKS {
                continue;
            }
            for (i, entry) in self.buckets[bucket].iter().enumerate() {
                if let Some(e) = entry {
                    let next = self.alternate(e.key, bucket);
                    if on_path(nodes, n, next) {
                        continue;
                    }
                    nodes.push(PathNode {
                        bucket: next,
                        parent: Some(n),
                        via: i,
                    });
                    queue.push_back(nodes.len() - 1);
                }
            }
        }
        None
    }
}

/// Whether `bucket` already appears between node `n` and its root
fn on_path(nodes: &[PathNode], mut n: usize, bucket: usize) -> bool {
    loop {
        if nodes[n].bucket == bucket {
            return true;
        }
        match nodes[n].parent {
            Some(p) => n = p,
            None => return false,
        }
    }
}

impl IndexBackend for CuckooIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Cuckoo
    }

    fn get(&self, key: Key) -> Option<usize> {
        self.locate(key)
            .and_then(|(b, i)| self.buckets[b][i].map(|e| e.slot))
    }

    fn insert(&mut self, key: Key, slot: usize) -> Result<(), IndexFull> {
        if let Some((b, i)) = self.locate(key) {
            self.buckets[b][i] = Some(Entry { key, slot });
            return Ok(());
        }

        let mut nodes = Vec::new();
        let (mut n, mut free) = self.find_path(key, &mut nodes).ok_or(IndexFull { key })?;

        // Shift the chain one step toward the free entry
        while let Some(parent) = nodes[n].parent {
            let from = (nodes[parent].bucket, nodes[n].via);
            let moved = self.buckets[from.0][from.1].take();
            self.buckets[nodes[n].bucket][free] = moved;
            free = from.1;
            n = parent;
        }

        self.buckets[nodes[n].bucket][free] = Some(Entry { key, slot });
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, key: Key) -> Option<usize> {
        let (b, i) = self.locate(key)?;
        let entry = self.buckets[b][i].take()?;
        self.len -= 1;
        Some(entry.slot)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn entries(&self) -> Vec<(Key, usize)> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter().flatten().map(|e| (e.key, e.slot)))
            .collect()
    }
}
