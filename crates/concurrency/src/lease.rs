//! Lock word state machine
//!
//! Every record carries one 64-bit lock word:
//!
//! ```text
//! bits 62..64  state: 00 free, 01 exclusive lock, 10 read lease
//! lock:        bits 0..62 owner token
//! lease:       bits 40..62 reader count, bits 0..40 expiry snapshot
//! ```
//!
//! A read lease whose expiry is at or below the current SS reads as
//! [`LockState::Expired`] and may be taken over by a lock or a new lease.
//! The reader count lets a transaction that is the only holder of a lease
//! upgrade it to the exclusive lock without waiting for it to lapse. Only
//! the functions here touch the word; the local path and the partition
//! server share them, so the states and transitions are identical whether a
//! request arrives in-process or over the messaging channel.
//!
//! ## Reader count
//!
//! Every grant bumps the count; a grant on a free or expired word starts
//! it at 1. A holder gives its lease back with [`release_lease`], which
//! only counts down while the word still carries the holder's own expiry.
//! Once another reader extends the lease the earlier holders can no longer
//! count down, so the count may overstate the holders but never understates
//! them. An overstated count only delays upgrades until the lease lapses.

use std::sync::atomic::{AtomicU64, Ordering};

const STATE_SHIFT: u32 = 62;
const PAYLOAD: u64 = (1 << STATE_SHIFT) - 1;
const STATE_LOCK: u64 = 1;
const STATE_LEASE: u64 = 2;

const READERS_SHIFT: u32 = 40;
const END_MASK: u64 = (1 << READERS_SHIFT) - 1;
/// A lease counted this high stays counted until it lapses
const MAX_READERS: u64 = (1 << (STATE_SHIFT - READERS_SHIFT)) - 1;

/// Decoded lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No lock or lease
    Free,
    /// Exclusively held
    Locked {
        /// Owner token
        owner: u64,
    },
    /// Shared read lease, valid while SS < `end`
    ReadLease {
        /// Expiry snapshot
        end: u64,
        /// Holders counted on the word
        readers: u64,
    },
    /// Read lease whose expiry has passed
    Expired {
        /// Expiry snapshot
        end: u64,
    },
}

/// Result of a lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock is now held by the caller
    Acquired,
    /// The caller already held it
    AlreadyHeld,
    /// Another owner holds it
    HeldByOther {
        /// Current owner
        owner: u64,
    },
    /// An unexpired read lease blocks it
    Leased {
        /// Lease expiry
        end: u64,
    },
}

impl LockOutcome {
    /// Whether the caller holds the lock after this attempt
    pub fn is_held(self) -> bool {
        matches!(self, LockOutcome::Acquired | LockOutcome::AlreadyHeld)
    }
}

/// Result of a lease attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Lease in force until `end` (possibly later than requested)
    Granted {
        /// Effective expiry
        end: u64,
    },
    /// An exclusive lock blocks it
    Locked {
        /// Current owner
        owner: u64,
    },
}

/// Encode an exclusive lock word
pub fn lock_word(owner: u64) -> u64 {
    (STATE_LOCK << STATE_SHIFT) | (owner & PAYLOAD)
}

/// Encode a read lease word held by `readers` holders
///
/// Expiries are kept to 40 bits and counts saturate.
pub fn lease_word(end: u64, readers: u64) -> u64 {
    (STATE_LEASE << STATE_SHIFT) | (readers.min(MAX_READERS) << READERS_SHIFT) | (end & END_MASK)
}

/// Decode `word` as seen at snapshot `now`
pub fn decode(word: u64, now: u64) -> LockState {
    match word >> STATE_SHIFT {
        STATE_LOCK => LockState::Locked {
            owner: word & PAYLOAD,
        },
        STATE_LEASE => {
            let end = word & END_MASK;
            if now < end {
                LockState::ReadLease {
                    end,
                    readers: (word & PAYLOAD) >> READERS_SHIFT,
                }
            } else {
                LockState::Expired { end }
            }
        }
        _ => LockState::Free,
    }
}

/// Current state of `word` at snapshot `now`
pub fn state(word: &AtomicU64, now: u64) -> LockState {
    decode(word.load(Ordering::Acquire), now)
}

/// One non-blocking attempt to take the exclusive lock for `owner`
///
/// Succeeds on a free word or an expired lease. Re-entrant for the owner.
/// `own_lease` is the expiry of a lease the caller holds on this record:
/// when the caller is its only counted holder, the lease is upgraded in
/// place.
pub fn try_lock(word: &AtomicU64, owner: u64, now: u64, own_lease: Option<u64>) -> LockOutcome {
    let desired = lock_word(owner);
    let mut current = word.load(Ordering::Acquire);
    loop {
        match decode(current, now) {
            LockState::Free | LockState::Expired { .. } => {}
            LockState::ReadLease { end, readers: 1 } if own_lease == Some(end) => {}
            LockState::ReadLease { end, .. } => return LockOutcome::Leased { end },
            LockState::Locked { owner: held } if held == owner & PAYLOAD => {
                return LockOutcome::AlreadyHeld
            }
            LockState::Locked { owner: held } => return LockOutcome::HeldByOther { owner: held },
        }
        match word.compare_exchange_weak(current, desired, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return LockOutcome::Acquired,
            Err(actual) => current = actual,
        }
    }
}

/// One non-blocking attempt to take a read lease until `end`
///
/// Compatible with other leases: an existing lease is extended to the later
/// of the two expiries and counts one more holder. Blocked only by an
/// exclusive lock.
pub fn try_lease(word: &AtomicU64, end: u64, now: u64) -> LeaseOutcome {
    let mut current = word.load(Ordering::Acquire);
    loop {
        let (effective, readers) = match decode(current, now) {
            LockState::Locked { owner } => return LeaseOutcome::Locked { owner },
            LockState::ReadLease { end: held, readers } => (held.max(end), readers + 1),
            LockState::Free | LockState::Expired { .. } => (end, 1),
        };
        match word.compare_exchange_weak(
            current,
            lease_word(effective, readers),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return LeaseOutcome::Granted { end: effective },
            Err(actual) => current = actual,
        }
    }
}

/// Give back a lease granted until `end`
///
/// Counts one holder down while the word still carries `end` unexpired;
/// the last holder frees the word. Returns whether the count moved.
pub fn release_lease(word: &AtomicU64, end: u64, now: u64) -> bool {
    let mut current = word.load(Ordering::Acquire);
    loop {
        let next = match decode(current, now) {
            LockState::ReadLease { end: held, readers } if held == end && readers < MAX_READERS => {
                if readers <= 1 {
                    0
                } else {
                    lease_word(held, readers - 1)
                }
            }
            _ => return false,
        };
        match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Release `owner`'s exclusive lock; `false` if `owner` does not hold it
pub fn unlock(word: &AtomicU64, owner: u64) -> bool {
    word.compare_exchange(lock_word(owner), 0, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Whether a lease ending at `end` is still valid at snapshot `now`
#[inline]
pub fn lease_valid(end: u64, now: u64) -> bool {
    now < end
}
