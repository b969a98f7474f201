//! Epoch snapshot manager
//!
//! Maintains the global snapshot number (SS) and one watermark slot per
//! worker thread.
//!
//! ## Slots
//!
//! A slot is a single `AtomicU64`, written only by its owning thread:
//!
//! ```text
//! bit 63      registered
//! bit 62      active (a read-write transaction is running)
//! bits 0..62  watermark
//! ```
//!
//! An active slot contributes its watermark to the safe read snapshot. An
//! idle slot contributes the current global SS: a thread between
//! transactions holds nothing back.
//!
//! ## Safe read snapshot
//!
//! `min(effective watermark) - 1`, clamped so it never decreases. Any
//! read-write transaction that can still commit has a watermark no larger
//! than its commit snapshot, so every version stamped at or below the safe
//! snapshot is fully written.
//!
//! ## Reader pins
//!
//! Snapshot readers pin the snapshot they read at. Version GC never prunes
//! past the lowest pin.

use crate::backoff::Backoff;
use epochkv_core::{Error, Result, ThreadId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const REGISTERED: u64 = 1 << 63;
const ACTIVE: u64 = 1 << 62;
const WATERMARK: u64 = ACTIVE - 1;

/// Poll interval used by [`SnapshotManager::wait_until`]
const WAIT_POLL: Duration = Duration::from_micros(400);

/// Epoch timing observed by the ticker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochStats {
    /// Number of advances performed by the ticker
    pub ticks: u64,
    /// Mean observed epoch length
    pub mean: Duration,
    /// Shortest observed epoch
    pub min: Duration,
    /// Longest observed epoch
    pub max: Duration,
    /// Epochs that overran the interval by more than the grace delta
    pub late: u64,
}

#[derive(Debug, Default)]
struct EpochAccumulator {
    ticks: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    late: u64,
}

/// Global snapshot number plus per-thread watermarks
#[derive(Debug)]
pub struct SnapshotManager {
    global: AtomicU64,
    slots: Box<[AtomicU64]>,
    /// `snapshot + 1` while a reader holds a pin, else 0
    pins: Box<[AtomicU64]>,
    safe_floor: AtomicU64,
    gc_announced: AtomicU64,
    epochs: Mutex<EpochAccumulator>,
}

impl SnapshotManager {
    /// Create a manager with room for `threads` worker threads
    ///
    /// The global SS starts at 1.
    pub fn new(threads: usize) -> Self {
        Self {
            global: AtomicU64::new(1),
            slots: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            pins: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            safe_floor: AtomicU64::new(0),
            gc_announced: AtomicU64::new(0),
            epochs: Mutex::new(EpochAccumulator::default()),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, tid: ThreadId) -> Result<&AtomicU64> {
        self.slots.get(tid).ok_or(Error::ThreadNotRegistered(tid))
    }

    fn registered_slot(&self, tid: ThreadId) -> Result<(&AtomicU64, u64)> {
        let slot = self.slot(tid)?;
        let word = slot.load(Ordering::SeqCst);
        if word & REGISTERED == 0 {
            return Err(Error::ThreadNotRegistered(tid));
        }
        Ok((slot, word))
    }

    /// Register `tid`; its watermark starts at 1
    ///
    /// Must be called once before the thread runs any transaction.
    pub fn register_thread(&self, tid: ThreadId) -> Result<()> {
        self.slot(tid)?.store(REGISTERED | 1, Ordering::SeqCst);
        tracing::trace!(tid, "thread registered");
        Ok(())
    }

    /// Release `tid`'s slot
    pub fn deregister_thread(&self, tid: ThreadId) {
        if let Some(slot) = self.slots.get(tid) {
            slot.store(0, Ordering::SeqCst);
        }
        if let Some(pin) = self.pins.get(tid) {
            pin.store(0, Ordering::SeqCst);
        }
    }

    /// Number of registered threads
    pub fn registered_threads(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::SeqCst) & REGISTERED != 0)
            .count()
    }

    /// Current global SS
    pub fn global_ss(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Advance the global SS by one and return the new value
    pub fn advance(&self) -> u64 {
        self.global.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last watermark published by `tid`
    pub fn local_ss(&self, tid: ThreadId) -> Result<u64> {
        Ok(self.registered_slot(tid)?.1 & WATERMARK)
    }

    /// Whether `tid` is inside a read-write transaction
    pub fn is_active(&self, tid: ThreadId) -> Result<bool> {
        Ok(self.registered_slot(tid)?.1 & ACTIVE != 0)
    }

    /// Publish `value` as `tid`'s watermark and mark the slot active
    ///
    /// The watermark never decreases: a smaller `value` keeps the old one.
    pub fn update_local_ss(&self, tid: ThreadId, value: u64) -> Result<()> {
        let (slot, word) = self.registered_slot(tid)?;
        let wm = (word & WATERMARK).max(value & WATERMARK);
        slot.store(REGISTERED | ACTIVE | wm, Ordering::SeqCst);
        Ok(())
    }

    /// End `tid`'s read-write transaction, publishing its commit snapshot
    pub fn publish_commit(&self, tid: ThreadId, commit_ss: u64) -> Result<()> {
        let (slot, word) = self.registered_slot(tid)?;
        let wm = (word & WATERMARK).max(commit_ss & WATERMARK);
        slot.store(REGISTERED | wm, Ordering::SeqCst);
        Ok(())
    }

    /// Mark `tid` idle without changing its watermark
    pub fn quiesce(&self, tid: ThreadId) -> Result<()> {
        let (slot, word) = self.registered_slot(tid)?;
        slot.store(word & !ACTIVE, Ordering::SeqCst);
        Ok(())
    }

    /// Minimum effective watermark, `None` if nothing is registered
    fn min_watermark(&self) -> Option<u64> {
        // Load the global SS before scanning so idle slots never count
        // for more than an active thread could have published meanwhile
        let global = self.global_ss();
        self.slots
            .iter()
            .map(|s| s.load(Ordering::SeqCst))
            .filter(|w| w & REGISTERED != 0)
            .map(|w| if w & ACTIVE != 0 { w & WATERMARK } else { global })
            .min()
    }

    /// Safe read snapshot: `min(watermark) - 1`
    ///
    /// Returns `None` while no thread is registered. Never decreases and
    /// never reaches the current global SS.
    pub fn compute_safe_read_ss(&self) -> Option<u64> {
        let candidate = self.min_watermark()?.saturating_sub(1);
        let previous = self.safe_floor.fetch_max(candidate, Ordering::SeqCst);
        Some(previous.max(candidate))
    }

    /// Block until every registered watermark is at least `target`
    ///
    /// Idle threads count as the current global SS, so with the ticker
    /// running this returns once in-flight read-write transactions finish.
    /// A caller inside its own read-write transaction holds its watermark
    /// down and must not wait past it.
    pub fn wait_until(&self, target: u64) {
        let mut backoff = Backoff::new(WAIT_POLL);
        while !self.reached(target) {
            backoff.snooze();
        }
    }

    /// [`wait_until`](Self::wait_until) with a deadline; `false` on timeout
    pub fn wait_until_timeout(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(WAIT_POLL);
        loop {
            if self.reached(target) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze();
        }
    }

    fn reached(&self, target: u64) -> bool {
        self.min_watermark().map_or(true, |m| m >= target)
    }

    /// Pin the current safe snapshot for `tid` and return it
    pub fn pin_snapshot(&self, tid: ThreadId) -> Result<u64> {
        let pin = self.pins.get(tid).ok_or(Error::ThreadNotRegistered(tid))?;
        loop {
            let snapshot = self
                .compute_safe_read_ss()
                .ok_or(Error::ThreadNotRegistered(tid))?;
            pin.store(snapshot + 1, Ordering::SeqCst);
            // A collector that announced past us may already be pruning
            if self.gc_announced.load(Ordering::SeqCst) <= snapshot {
                return Ok(snapshot);
            }
        }
    }

    /// Drop `tid`'s pin
    pub fn unpin(&self, tid: ThreadId) {
        if let Some(pin) = self.pins.get(tid) {
            pin.store(0, Ordering::SeqCst);
        }
    }

    /// Highest snapshot whose older versions no reader can need
    ///
    /// Announces the candidate before scanning pins; see
    /// [`pin_snapshot`](Self::pin_snapshot) for the other half.
    pub fn gc_horizon(&self) -> Option<u64> {
        let candidate = self.compute_safe_read_ss()?;
        self.gc_announced.fetch_max(candidate, Ordering::SeqCst);
        let lowest_pin = self
            .pins
            .iter()
            .map(|p| p.load(Ordering::SeqCst))
            .filter(|&p| p != 0)
            .map(|p| p - 1)
            .min();
        Some(lowest_pin.map_or(candidate, |p| p.min(candidate)))
    }

    fn record_epoch(&self, elapsed: Duration, late: bool) {
        let mut acc = self.epochs.lock();
        acc.ticks += 1;
        acc.total += elapsed;
        acc.min = Some(acc.min.map_or(elapsed, |m| m.min(elapsed)));
        acc.max = acc.max.max(elapsed);
        if late {
            acc.late += 1;
        }
    }

    /// Epoch timing observed so far
    pub fn epoch_stats(&self) -> EpochStats {
        let acc = self.epochs.lock();
        let mean = if acc.ticks == 0 {
            Duration::ZERO
        } else {
            acc.total / acc.ticks as u32
        };
        EpochStats {
            ticks: acc.ticks,
            mean,
            min: acc.min.unwrap_or_default(),
            max: acc.max,
            late: acc.late,
        }
    }
}

/// Background thread advancing the global SS once per epoch
///
/// Stops and joins when dropped.
#[derive(Debug)]
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    /// Start advancing `snapshots` every `interval`
    ///
    /// # Arguments
    /// * `interval` - Epoch length
    /// * `delta` - Overrun tolerated before an epoch is counted as late
    pub fn start(snapshots: Arc<SnapshotManager>, interval: Duration, delta: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("epochkv-epoch".into())
            .spawn(move || {
                tracing::info!(interval_us = interval.as_micros() as u64, "epoch ticker started");
                let mut last = Instant::now();
                while !flag.load(Ordering::Acquire) {
                    let elapsed = last.elapsed();
                    if elapsed < interval {
                        thread::park_timeout(interval - elapsed);
                        continue;
                    }
                    last = Instant::now();
                    let ss = snapshots.advance();
                    snapshots.record_epoch(elapsed, elapsed > interval + delta);
                    tracing::trace!(ss, "epoch advanced");
                }
                tracing::info!(ss = snapshots.global_ss(), "epoch ticker stopped");
            })
            .map_err(|e| Error::Internal(format!("failed to spawn epoch ticker: {}", e)))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the ticker and wait for its thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("epoch ticker panicked");
            }
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ===== Registration Tests =====

    #[test]
    fn test_register_sets_watermark_to_one() {
        let sm = SnapshotManager::new(2);
        assert_eq!(sm.global_ss(), 1);
        sm.register_thread(0).unwrap();
        assert_eq!(sm.local_ss(0).unwrap(), 1);
        assert_eq!(sm.registered_threads(), 1);
        assert_eq!(sm.local_ss(1), Err(Error::ThreadNotRegistered(1)));
        assert_eq!(sm.register_thread(5), Err(Error::ThreadNotRegistered(5)));
    }

    #[test]
    fn test_no_registered_threads_has_no_safe_snapshot() {
        let sm = SnapshotManager::new(4);
        assert_eq!(sm.compute_safe_read_ss(), None);
        assert_eq!(sm.gc_horizon(), None);
    }

    // ===== Watermark Tests =====

    #[test]
    fn test_safe_snapshot_is_min_active_watermark_minus_one() {
        let sm = SnapshotManager::new(3);
        for tid in 0..3 {
            sm.register_thread(tid).unwrap();
        }
        for _ in 0..9 {
            sm.advance();
        }
        assert_eq!(sm.global_ss(), 10);
        // All idle: bounded by the global SS
        assert_eq!(sm.compute_safe_read_ss(), Some(9));

        sm.update_local_ss(0, 10).unwrap();
        sm.advance();
        sm.update_local_ss(1, 11).unwrap();
        assert_eq!(sm.compute_safe_read_ss(), Some(9));

        sm.publish_commit(0, 11).unwrap();
        assert_eq!(sm.local_ss(0).unwrap(), 11);
        assert!(!sm.is_active(0).unwrap());
        assert_eq!(sm.compute_safe_read_ss(), Some(10));
    }

    #[test]
    fn test_watermark_never_decreases() {
        let sm = SnapshotManager::new(1);
        sm.register_thread(0).unwrap();
        sm.update_local_ss(0, 7).unwrap();
        sm.update_local_ss(0, 3).unwrap();
        assert_eq!(sm.local_ss(0).unwrap(), 7);
        sm.quiesce(0).unwrap();
        assert_eq!(sm.local_ss(0).unwrap(), 7);
        assert!(!sm.is_active(0).unwrap());
    }

    #[test]
    fn test_safe_snapshot_below_global() {
        let sm = SnapshotManager::new(1);
        sm.register_thread(0).unwrap();
        for _ in 0..5 {
            let safe = sm.compute_safe_read_ss().unwrap();
            assert!(safe < sm.global_ss());
            sm.advance();
        }
    }

    // ===== WaitUntil Tests =====

    #[test]
    fn test_wait_until_returns_when_reached() {
        let sm = SnapshotManager::new(2);
        sm.register_thread(0).unwrap();
        sm.register_thread(1).unwrap();
        sm.update_local_ss(1, 1).unwrap();
        assert!(!sm.wait_until_timeout(3, Duration::from_millis(5)));

        sm.advance();
        sm.advance();
        sm.publish_commit(1, 3).unwrap();
        assert!(sm.wait_until_timeout(3, Duration::from_millis(5)));
        sm.wait_until(3);
    }

    #[test]
    fn test_wait_until_unblocks_on_other_thread() {
        let sm = Arc::new(SnapshotManager::new(1));
        sm.register_thread(0).unwrap();
        sm.update_local_ss(0, 1).unwrap();

        let waiter = {
            let sm = Arc::clone(&sm);
            thread::spawn(move || sm.wait_until(2))
        };
        thread::sleep(Duration::from_millis(5));
        sm.advance();
        sm.publish_commit(0, 2).unwrap();
        waiter.join().unwrap();
    }

    // ===== Pin / GC Tests =====

    #[test]
    fn test_pins_hold_gc_horizon() {
        let sm = SnapshotManager::new(2);
        sm.register_thread(0).unwrap();
        sm.register_thread(1).unwrap();
        sm.advance();
        sm.advance();
        let pinned = sm.pin_snapshot(0).unwrap();
        assert_eq!(pinned, 2);

        for _ in 0..5 {
            sm.advance();
        }
        assert_eq!(sm.gc_horizon(), Some(2));
        sm.unpin(0);
        assert_eq!(sm.gc_horizon(), Some(7));
    }

    #[test]
    fn test_pin_after_gc_announcement_moves_forward() {
        let sm = SnapshotManager::new(1);
        sm.register_thread(0).unwrap();
        sm.advance();
        let h = sm.gc_horizon().unwrap();
        let pinned = sm.pin_snapshot(0).unwrap();
        assert!(pinned >= h);
    }

    // ===== Ticker Tests =====

    #[test]
    fn test_ticker_advances_and_stops() {
        let sm = Arc::new(SnapshotManager::new(1));
        let start = sm.global_ss();
        let ticker =
            EpochTicker::start(Arc::clone(&sm), Duration::from_millis(1), Duration::from_micros(200))
                .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sm.global_ss() < start + 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        ticker.stop();
        let stopped_at = sm.global_ss();
        assert!(stopped_at >= start + 3);

        thread::sleep(Duration::from_millis(5));
        assert_eq!(sm.global_ss(), stopped_at);

        let stats = sm.epoch_stats();
        assert_eq!(stats.ticks, stopped_at - start);
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        assert!(stats.min >= Duration::from_millis(1));
    }

    proptest! {
        #[test]
        fn prop_safe_snapshot_monotonic(ops in proptest::collection::vec((0usize..4, 0u8..4), 1..100)) {
            let sm = SnapshotManager::new(4);
            for tid in 0..4 {
                sm.register_thread(tid).unwrap();
            }
            let mut last_global = sm.global_ss();
            let mut last_safe = sm.compute_safe_read_ss().unwrap();
            for (tid, action) in ops {
                match action {
                    0 => { sm.advance(); }
                    1 => sm.update_local_ss(tid, sm.global_ss()).unwrap(),
                    2 => sm.publish_commit(tid, sm.global_ss()).unwrap(),
                    _ => sm.quiesce(tid).unwrap(),
                }
                let global = sm.global_ss();
                let safe = sm.compute_safe_read_ss().unwrap();
                prop_assert!(global >= last_global);
                prop_assert!(safe >= last_safe);
                prop_assert!(safe < global);
                last_global = global;
                last_safe = safe;
            }
        }
    }
}
