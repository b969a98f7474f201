//! Versioned records
//!
//! A record is the unit the lock/lease protocol protects. It carries:
//! - a 64-bit lock word, mutated only through the lock-word state machine
//! - a chain of versions ordered by commit snapshot (`stamp`)
//!
//! Each version also carries the global commit sequence number (`seq`)
//! of the transaction that wrote it, used for first-committer-wins checks.
//! A version whose value is `None` is a tombstone.

use epochkv_core::Key;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Immutable value bytes, shared between versions and readers
pub type Value = Arc<[u8]>;

/// One committed version of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Snapshot number at which the version became visible
    pub stamp: u64,
    /// Commit sequence number of the writing transaction
    pub seq: u64,
    /// Value, or `None` for a delete
    pub value: Option<Value>,
}

/// A record with its lock word and version chain
#[derive(Debug)]
pub struct Record {
    key: Key,
    lock: AtomicU64,
    versions: RwLock<SmallVec<[Version; 2]>>,
}

impl Record {
    /// Create a record with no versions
    pub fn new(key: Key) -> Self {
        Self {
            key,
            lock: AtomicU64::new(0),
            versions: RwLock::new(SmallVec::new()),
        }
    }

    /// Key of this record
    pub fn key(&self) -> Key {
        self.key
    }

    /// Lock word
    ///
    /// Only the lock-word state machine may mutate it.
    pub fn lock_word(&self) -> &AtomicU64 {
        &self.lock
    }

    /// Newest version with `stamp <= snapshot`
    pub fn read_at(&self, snapshot: u64) -> Option<Version> {
        self.versions
            .read()
            .iter()
            .rev()
            .find(|v| v.stamp <= snapshot)
            .cloned()
    }

    /// Newest version regardless of stamp
    pub fn read_latest(&self) -> Option<Version> {
        self.versions.read().last().cloned()
    }

    /// Commit sequence of the newest version, 0 if none
    pub fn latest_seq(&self) -> u64 {
        self.versions.read().last().map_or(0, |v| v.seq)
    }

    /// Install a version
    ///
    /// Versions stay sorted by stamp. A version with the same stamp as an
    /// existing one replaces it.
    pub fn install(&self, version: Version) {
        let mut versions = self.versions.write();
        match versions.binary_search_by_key(&version.stamp, |v| v.stamp) {
            Ok(i) => versions[i] = version,
            Err(i) => versions.insert(i, version),
        }
    }

    /// Drop versions no snapshot at or above `horizon` can observe
    ///
    /// Keeps the newest version with `stamp <= horizon` and everything
    /// newer. Returns the number of versions removed.
    pub fn prune(&self, horizon: u64) -> usize {
        let mut versions = self.versions.write();
        let visible = versions.iter().rposition(|v| v.stamp <= horizon);
        match visible {
            Some(i) if i > 0 => {
                versions.drain(..i);
                i
            }
            _ => 0,
        }
    }

    /// Number of retained versions
    pub fn version_count(&self) -> usize {
        self.versions.read().len()
    }

    /// Whether no version was ever installed
    pub fn is_vacant(&self) -> bool {
        self.versions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(stamp: u64, seq: u64, value: &[u8]) -> Version {
        Version {
            stamp,
            seq,
            value: Some(Arc::from(value)),
        }
    }

    #[test]
    fn test_read_at_picks_newest_visible() {
        let record = Record::new(5);
        record.install(v(2, 1, b"a"));
        record.install(v(4, 2, b"b"));

        assert_eq!(record.read_at(1), None);
        assert_eq!(record.read_at(2).unwrap().value.as_deref(), Some(&b"a"[..]));
        assert_eq!(record.read_at(3).unwrap().value.as_deref(), Some(&b"a"[..]));
        assert_eq!(record.read_at(9).unwrap().value.as_deref(), Some(&b"b"[..]));
        assert_eq!(record.latest_seq(), 2);
    }

    #[test]
    fn test_same_stamp_replaces() {
        let record = Record::new(1);
        record.install(v(3, 1, b"x"));
        record.install(v(3, 2, b"y"));
        assert_eq!(record.version_count(), 1);
        assert_eq!(record.read_latest().unwrap().seq, 2);
    }

    #[test]
    fn test_tombstone_hides_value() {
        let record = Record::new(1);
        record.install(v(1, 1, b"x"));
        record.install(Version {
            stamp: 2,
            seq: 2,
            value: None,
        });
        assert!(record.read_at(1).unwrap().value.is_some());
        assert!(record.read_at(2).unwrap().value.is_none());
    }

    #[test]
    fn test_vacant_until_first_install() {
        let record = Record::new(4);
        assert!(record.is_vacant());
        record.install(Version {
            stamp: 1,
            seq: 1,
            value: None,
        });
        // A tombstone still counts as written
        assert!(!record.is_vacant());
    }

    #[test]
    fn test_prune_keeps_horizon_version() {
        let record = Record::new(1);
        for stamp in 1..=5 {
            record.install(v(stamp, stamp, b"v"));
        }
        assert_eq!(record.prune(3), 2);
        assert_eq!(record.version_count(), 3);
        assert_eq!(record.read_at(3).unwrap().stamp, 3);
        assert_eq!(record.prune(0), 0);
    }
}
