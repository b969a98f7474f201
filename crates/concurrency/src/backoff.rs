//! Bounded retry with backoff
//!
//! Every blocking wait in the transaction layer (local lock spins, remote
//! lock/lease resends, watermark convergence) goes through this module so
//! timeouts mean the same thing everywhere:
//!
//! - the first attempts spin with growing `spin_loop` bursts
//! - the next attempts yield the thread
//! - after that each retry sleeps one poll interval
//!
//! A [`BoundedRetry`] gives up once its single deadline passes.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// The attempt succeeded
    Ready(T),
    /// Not yet; try again after backing off
    Pending,
}

/// Escalating spin / yield / sleep backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    step: u32,
    poll: Duration,
}

impl Backoff {
    /// Create a backoff that sleeps `poll` once spinning and yielding are exhausted
    pub fn new(poll: Duration) -> Self {
        Self { step: 0, poll }
    }

    /// Wait a little longer than last time
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(self.poll);
        }
        self.step = self.step.saturating_add(1);
    }

    /// Start over from spinning
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// Retry an attempt until it succeeds or one deadline passes
#[derive(Debug, Clone, Copy)]
pub struct BoundedRetry {
    timeout: Duration,
    poll: Duration,
}

impl BoundedRetry {
    /// Create a retry policy
    ///
    /// # Arguments
    /// * `timeout` - Total time budget, measured from the first attempt
    /// * `poll` - Sleep granularity once spinning and yielding are exhausted
    pub fn new(timeout: Duration, poll: Duration) -> Self {
        Self { timeout, poll }
    }

    /// Total time budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Same policy ending at `deadline` instead
    pub fn until(&self, deadline: Instant) -> Self {
        Self {
            timeout: deadline.saturating_duration_since(Instant::now()),
            poll: self.poll,
        }
    }

    /// Run `attempt` until it is ready, fails, or the deadline passes
    ///
    /// The attempt always runs at least once.
    ///
    /// # Returns
    /// - `Ok(Some(value))` when an attempt is ready
    /// - `Ok(None)` on timeout
    /// - `Err(e)` as soon as an attempt fails
    pub fn run<T, E>(
        &self,
        mut attempt: impl FnMut() -> Result<Step<T>, E>,
    ) -> Result<Option<T>, E> {
        let deadline = Instant::now() + self.timeout;
        let mut backoff = Backoff::new(self.poll);
        loop {
            if let Step::Ready(value) = attempt()? {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            backoff.snooze();
        }
    }
}
