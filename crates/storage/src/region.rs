//! Emulated hardware-transactional region
//!
//! Local write-back runs inside an atomic region so the whole write set of a
//! transaction becomes visible on this partition at once. The region is a
//! per-partition mutex entered with a deadline. Failing to enter it is
//! reported as an abort, the same outcome a hardware transaction reports
//! when it cannot commit.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// The region could not be entered before the deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("atomic region aborted")]
pub struct RegionAborted;

/// Region execution counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Regions that ran to completion
    pub committed: u64,
    /// Regions that could not be entered
    pub aborted: u64,
}

/// Per-partition atomic region
#[derive(Debug, Default)]
pub struct AtomicRegion {
    gate: Mutex<()>,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl AtomicRegion {
    /// Create a region
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` atomically with respect to other regions on this partition
    ///
    /// # Errors
    ///
    /// [`RegionAborted`] if the region is not entered within `timeout`;
    /// `f` has not run in that case.
    pub fn execute<T>(&self, timeout: Duration, f: impl FnOnce() -> T) -> Result<T, RegionAborted> {
        let Some(_guard) = self.gate.try_lock_for(timeout) else {
            self.aborted.fetch_add(1, Ordering::Relaxed);
            return Err(RegionAborted);
        };
        let out = f();
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> RegionStats {
        RegionStats {
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}
