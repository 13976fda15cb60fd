//! Token bucket state.

use std::time::Duration;
use tokio::time::Instant;

/// Per-key token bucket.
///
/// Tokens are fractional and always stay within `0.0..=capacity`.
#[derive(Debug, Clone)]
pub(crate) struct Bucket {
    /// Tokens currently available
    tokens: f64,
    /// Last time `tokens` was recomputed
    last_refill: Instant,
}

impl Bucket {
    /// Create a bucket holding `capacity` tokens.
    pub(crate) fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Add the tokens earned since the last refill, saturating at `capacity`.
    ///
    /// A `now` earlier than the last refill counts as no elapsed time.
    pub(crate) fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    /// Consume one token if a whole token is available.
    pub(crate) fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time since this bucket was last touched.
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill)
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }
}
