//! Cluster hashing
//!
//! Keys hash to a logical header holding [`CLUSTER_WIDTH`] key slots. A
//! full header links to an indirect header drawn from a shared pool, so a
//! bucket is a short chain of fixed-width groups. The logical table has one
//! header per `CLUSTER_WIDTH` keys of capacity; the indirect pool holds
//! half as many headers.

use super::{IndexBackend, IndexFull};
use crate::hash::hash_key;
use epochkv_core::{BackendKind, Key};

/// Key slots per header
pub const CLUSTER_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct Header {
    keys: [Key; CLUSTER_WIDTH],
    slots: [usize; CLUSTER_WIDTH],
    used: u8,
    next: Option<usize>,
}

impl Header {
    fn find(&self, key: Key) -> Option<usize> {
        (0..CLUSTER_WIDTH).find(|&i| self.used & (1 << i) != 0 && self.keys[i] == key)
    }

    fn free(&self) -> Option<usize> {
        (0..CLUSTER_WIDTH).find(|&i| self.used & (1 << i) == 0)
    }
}

/// Header reference: logical table or indirect pool
#[derive(Debug, Clone, Copy)]
enum HeaderRef {
    Logical(usize),
    Indirect(usize),
}

/// Cluster hash index
#[derive(Debug)]
pub struct ClusterIndex {
    logical: Vec<Header>,
    indirect: Vec<Header>,
    indirect_capacity: usize,
    len: usize,
}

impl ClusterIndex {
    /// Create an index sized for about `capacity` keys
    pub fn with_capacity(capacity: usize) -> Self {
        let headers = ((capacity + CLUSTER_WIDTH - 1) / CLUSTER_WIDTH).max(1);
        Self {
            logical: vec![Header::default(); headers],
            indirect: Vec::new(),
            indirect_capacity: (headers / 2).max(1),
            len: 0,
        }
    }

    fn header(&self, r: HeaderRef) -> &Header {
        match r {
            HeaderRef::Logical(i) => &self.logical[i],
            HeaderRef::Indirect(i) => &self.indirect[i],
        }
    }

    fn header_mut(&mut self, r: HeaderRef) -> &mut Header {
        match r {
            HeaderRef::Logical(i) => &mut self.logical[i],
            HeaderRef::Indirect(i) => &mut self.indirect[i],
        }
    }

    fn chain(&self, key: Key) -> Vec<HeaderRef> {
        let start = (hash_key(key) % self.logical.len() as u64) as usize;
        let mut refs = vec![HeaderRef::Logical(start)];
        let mut next = self.logical[start].next;
        while let Some(i) = next {
            refs.push(HeaderRef::Indirect(i));
            next = self.indirect[i].next;
        }
        refs
    }

    fn locate(&self, key: Key) -> Option<(HeaderRef, usize)> {
        self.chain(key)
            .into_iter()
            .find_map(|r| self.header(r).find(key).map(|i| (r, i)))
    }
}

impl IndexBackend for ClusterIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    fn get(&self, key: Key) -> Option<usize> {
        self.locate(key).map(|(r, i)| self.header(r).slots[i])
    }

    fn insert(&mut self, key: Key, slot: usize) -> Result<(), IndexFull> {
        if let Some((r, i)) = self.locate(key) {
            self.header_mut(r).slots[i] = slot;
            return Ok(());
        }

        let chain = self.chain(key);
        let target = chain
            .iter()
            .find_map(|&r| self.header(r).free().map(|i| (r, i)));

        let (r, i) = match target {
            Some(found) => found,
            None => {
                if self.indirect.len() >= self.indirect_capacity {
                    return Err(IndexFull { key });
                }
                self.indirect.push(Header::default());
                let fresh = self.indirect.len() - 1;
                let tail = *chain.last().ok_or(IndexFull { key })?;
                self.header_mut(tail).next = Some(fresh);
                (HeaderRef::Indirect(fresh), 0)
            }
        };

        let header = self.header_mut(r);
        header.keys[i] = key;
        header.slots[i] = slot;
        header.used |= 1 << i;
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, key: Key) -> Option<usize> {
        let (r, i) = self.locate(key)?;
        let header = self.header_mut(r);
        header.used &= !(1 << i);
        let slot = header.slots[i];
        self.len -= 1;
        Some(slot)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn entries(&self) -> Vec<(Key, usize)> {
        self.logical
            .iter()
            .chain(self.indirect.iter())
            .flat_map(|h| {
                (0..CLUSTER_WIDTH)
                    .filter(move |&i| h.used & (1 << i) != 0)
                    .map(move |i| (h.keys[i], h.slots[i]))
            })
            .collect()
    }
}
