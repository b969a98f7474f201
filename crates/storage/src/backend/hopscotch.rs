//! Hopscotch hashing
//!
//! Every key lives within [`HOP_RANGE`] buckets of its home bucket. The
//! home bucket keeps a bitmap of which neighbours hold its keys, so a
//! lookup touches at most one neighbourhood. Inserts probe linearly for a
//! free bucket and hop it backwards into the neighbourhood; when no hop is
//! possible the key goes to the home bucket's overflow chain, drawn from a
//! node pool sized at a fifth of the table.

use super::{IndexBackend, IndexFull};
use crate::hash::hash_key;
use epochkv_core::{BackendKind, Key};

/// Neighbourhood width
pub const HOP_RANGE: usize = 8;

/// Longest linear probe when looking for a free bucket
const ADD_RANGE: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Key,
    slot: usize,
}

#[derive(Debug, Clone, Copy)]
struct OverflowNode {
    entry: Option<Entry>,
    next: Option<usize>,
}

/// Hopscotch hash index
#[derive(Debug)]
pub struct HopscotchIndex {
    buckets: Vec<Option<Entry>>,
    /// Bit `d` of `hop_info[h]`: bucket `h + d` holds a key homed at `h`
    hop_info: Vec<u8>,
    chains: Vec<Option<usize>>,
    pool: Vec<OverflowNode>,
    free_nodes: Vec<usize>,
    pool_capacity: usize,
    len: usize,
}

impl HopscotchIndex {
    /// Create an index with `capacity` buckets
    pub fn with_capacity(capacity: usize) -> Self {
        let n = capacity.max(1);
        Self {
            buckets: vec![None; n],
            hop_info: vec![0; n],
            chains: vec![None; n],
            pool: Vec::new(),
            free_nodes: Vec::new(),
            pool_capacity: (n / 5).max(1),
            len: 0,
        }
    }

    fn n(&self) -> usize {
        self.buckets.len()
    }

    fn home(&self, key: Key) -> usize {
        (hash_key(key) % self.n() as u64) as usize
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        (to + self.n() - from) % self.n()
    }

    fn offset(&self, base: usize, d: usize) -> usize {
        (base + d) % self.n()
    }

    fn find_in_neighbourhood(&self, home: usize, key: Key) -> Option<usize> {
        let bits = self.hop_info[home];
        (0..HOP_RANGE)
            .filter(|d| bits & (1 << d) != 0)
            .map(|d| self.offset(home, d))
            .find(|&idx| matches!(self.buckets[idx], Some(e) if e.key == key))
    }

    fn find_in_chain(&self, home: usize, key: Key) -> Option<usize> {
        let mut cursor = self.chains[home];
        while let Some(i) = cursor {
            if matches!(self.pool[i].entry, Some(e) if e.key == key) {
                return Some(i);
            }
            cursor = self.pool[i].next;
        }
        None
    }

    /// Move some entry closer to its home into `free`; returns the new
    /// free bucket
    fn hop_closer(&mut self, free: usize) -> Option<usize> {
        let reach = HOP_RANGE.min(self.n());
        for back in (1..reach).rev() {
            let candidate = (free + self.n() - back) % self.n();
            let bits = self.hop_info[candidate];
            for d in 0..back {
                if bits & (1 << d) == 0 {
                    continue;
                }
                let from = self.offset(candidate, d);
                self.buckets[free] = self.buckets[from].take();
                self.hop_info[candidate] &= !(1 << d);
                self.hop_info[candidate] |= 1 << back;
                return Some(from);
            }
        }
        None
    }

    fn push_overflow(&mut self, home: usize, entry: Entry) -> Result<(), IndexFull> {
        let node = OverflowNode {
            entry: Some(entry),
            next: self.chains[home],
        };
        let index = match self.free_nodes.pop() {
            Some(i) => {
                self.pool[i] = node;
                i
            }
            None if self.pool.len() < self.pool_capacity => {
                self.pool.push(node);
                self.pool.len() - 1
            }
            None => return Err(IndexFull { key: entry.key }),
        };
        self.chains[home] = Some(index);
        Ok(())
    }
}

impl IndexBackend for HopscotchIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Hopscotch
    }

    fn get(&self, key: Key) -> Option<usize> {
        let home = self.home(key);
        if let Some(idx) = self.find_in_neighbourhood(home, key) {
            return self.buckets[idx].map(|e| e.slot);
        }
        self.find_in_chain(home, key)
            .and_then(|i| self.pool[i].entry.map(|e| e.slot))
    }

    fn insert(&mut self, key: Key, slot: usize) -> Result<(), IndexFull> {
        let home = self.home(key);
        let entry = Entry { key, slot };
        if let Some(idx) = self.find_in_neighbourhood(home, key) {
            self.buckets[idx] = Some(entry);
            return Ok(());
        }
        if let Some(i) = self.find_in_chain(home, key) {
            self.pool[i].entry = Some(entry);
            return Ok(());
        }

        let probe = ADD_RANGE.min(self.n());
        let mut free = (0..probe)
            .map(|d| self.offset(home, d))
            .find(|&idx| self.buckets[idx].is_none());

        while let Some(f) = free {
            if self.distance(home, f) < HOP_RANGE {
                break;
            }
            free = self.hop_closer(f);
        }

        match free {
            Some(f) => {
                let d = self.distance(home, f);
                self.buckets[f] = Some(entry);
                self.hop_info[home] |= 1 << d;
            }
            None => self.push_overflow(home, entry)?,
        }
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, key: Key) -> Option<usize> {
        let home = self.home(key);
        if let Some(idx) = self.find_in_neighbourhood(home, key) {
            let d = self.distance(home, idx);
            self.hop_info[home] &= !(1 << d);
            self.len -= 1;
            return self.buckets[idx].take().map(|e| e.slot);
        }

        let mut prev: Option<usize> = None;
        let mut cursor = self.chains[home];
        while let Some(i) = cursor {
            let next = self.pool[i].next;
            if matches!(self.pool[i].entry, Some(e) if e.key == key) {
                match prev {
                    Some(p) => self.pool[p].next = next,
                    None => self.chains[home] = next,
                }
                let entry = self.pool[i].entry.take();
                self.pool[i].next = None;
                self.free_nodes.push(i);
                self.len -= 1;
                return entry.map(|e| e.slot);
            }
            prev = Some(i);
            cursor = next;
        }
        None
    }

    fn len(&self) -> usize {
        self.len
    }

    fn entries(&self) -> Vec<(Key, usize)> {
        self.buckets
            .iter()
            .flatten()
            .chain(self.pool.iter().filter_map(|n| n.entry.as_ref()))
            .map(|e| (e.key, e.slot))
            .collect()
    }
}
