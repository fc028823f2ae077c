//! Bounded exponential backoff carried as explicit state.
//!
//! Build retries and control channel reconnects both use this: the attempt
//! counter and the next delay live in the operation's own state, so a retry
//! loop can never outlive its budget.

use std::time::Duration;

use rand::Rng;

/// Retry budget with exponential delays and a small random jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Attempts already started
    attempt: u32,
    /// Total attempts allowed (including the first)
    max_attempts: u32,
    /// Delay before the next attempt
    next_delay: Duration,
    /// Delay cap
    max_delay: Duration,
    /// Multiplier applied after each retry
    factor: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            next_delay: initial,
            max_delay,
            factor: 2,
        }
    }

    /// Attempts started so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Register the start of an attempt. Returns false once the budget is spent.
    pub fn begin(&mut self) -> bool {
        if self.attempt >= self.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    /// True if another attempt may be started
    pub fn has_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Delay to wait before the next attempt, or `None` when the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_remaining() {
            return None;
        }

        let base = self.next_delay;
        self.next_delay = (base * self.factor).min(self.max_delay);

        // Up to 10% jitter so concurrent slots do not retry in lockstep
        let jitter_ms = (base.as_millis() as u64 / 10).max(1);
        let jitter = rand::rng().random_range(0..jitter_ms);
        Some(base + Duration::from_millis(jitter))
    }
}
