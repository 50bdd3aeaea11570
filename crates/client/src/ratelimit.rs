//! Per-operation token buckets derived from the `rateLimit` extension field.

use crate::spec::RateLimitSpec;
use std::time::{Duration, Instant};

/// Whole-window token bucket: `max` admissions per window, refilled when the
/// window elapses. The check happens before any network call is made.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    capacity: u32,
    tokens: u32,
    window: Duration,
    window_start: Instant,
}

impl TokenBucket {
    pub(crate) fn new(spec: RateLimitSpec, now: Instant) -> Self {
        Self {
            capacity: spec.max,
            tokens: spec.max,
            window: spec.window,
            window_start: now,
        }
    }

    /// Take one token. On exhaustion returns the duration until the window
    /// refills.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if now.duration_since(self.window_start) >= self.window {
            self.tokens = self.capacity;
            self.window_start = now;
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(self.window_start);
            Err(self.window.saturating_sub(elapsed))
        }
    }
}
