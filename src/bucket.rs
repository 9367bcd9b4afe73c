//! Token bucket arithmetic.
//!
//! [`BucketState`] is the only mutable part of a bucket: a token count and
//! the clock reading it was last refilled at. Everything here is pure; the
//! limiter decides where the state lives and how updates are made atomic.

use std::time::Duration;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Snapshot of a bucket: `(tokens, updated_at_nanos)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Available tokens. Always within `0.0..=capacity`.
    pub tokens: f64,
    /// Clock reading of the last refill.
    pub updated_at_nanos: u64,
}

/// Outcome of [`BucketState::try_take`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Take {
    /// One token was spent.
    Taken { remaining: f64 },
    /// Less than one token is available; `wait` is the time until there is one.
    Short { wait: Duration },
}

impl BucketState {
    /// A full bucket stamped with `now`.
    pub fn full(capacity: f64, now: u64) -> Self {
        Self { tokens: capacity, updated_at_nanos: now }
    }

    /// Add the tokens accrued since the last refill, capped at `capacity`.
    ///
    /// A `now` earlier than the stored timestamp accrues nothing and leaves
    /// the timestamp where it is.
    pub fn refill(self, now: u64, rate: f64, capacity: f64) -> Self {
        let elapsed = now.saturating_sub(self.updated_at_nanos) as f64 / NANOS_PER_SEC;
        Self {
            tokens: (self.tokens + elapsed * rate).clamp(0.0, capacity),
            updated_at_nanos: now.max(self.updated_at_nanos),
        }
    }

    /// Spend one token if a whole one is available.
    pub fn try_take(&mut self, rate: f64) -> Take {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Take::Taken { remaining: self.tokens }
        } else {
            Take::Short { wait: wait_for_one(self.tokens, rate) }
        }
    }

    /// True once the bucket has accrued back to `capacity` at `now`.
    pub fn is_full_at(&self, now: u64, rate: f64, capacity: f64) -> bool {
        self.refill(now, rate, capacity).tokens >= capacity
    }
}

/// Minimum time until `tokens` reaches one at `rate` tokens/second.
pub fn wait_for_one(tokens: f64, rate: f64) -> Duration {
    let secs = ((1.0 - tokens) / rate).max(0.0);
    // Round up to the next nanosecond. Refill after the wait can still land a
    // float ulp below one; the caller's retry loop absorbs that.
    Duration::from_nanos((secs * NANOS_PER_SEC).ceil() as u64)
}
