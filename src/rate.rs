//! Egress pacing.

use std::time::{Duration, Instant};

/// Byte-per-millisecond pacer gating egress flushes.
///
/// The limiter tracks bytes egressed since an epoch. Before each flush the
/// transaction asks [`delay_required`](RateLimiter::delay_required); a
/// `Some(delay)` answer means the flush must wait, and the caller arms a
/// wake-up for `now + delay`. A rate of zero disables pacing.
#[derive(Debug, Default)]
pub struct RateLimiter {
    bytes_per_ms: u64,
    epoch: Option<Instant>,
    bytes_egressed: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter::default()
    }

    /// Set the rate and reset the epoch. Zero disables pacing.
    pub fn set_rate(&mut self, bytes_per_ms: u64, now: Instant) {
        self.bytes_per_ms = bytes_per_ms;
        self.epoch = Some(now);
        self.bytes_egressed = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_per_ms > 0
    }

    /// Record bytes flushed toward the budget.
    pub fn record_egress(&mut self, bytes: u64) {
        if self.is_enabled() {
            self.bytes_egressed += bytes;
        }
    }

    /// If the budget since the epoch is spent, the delay after which the
    /// caller may try again.
    pub fn delay_required(&self, now: Instant) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let epoch = self.epoch?;
        let elapsed_ms = now.saturating_duration_since(epoch).as_millis() as u64;
        let budget = elapsed_ms.saturating_mul(self.bytes_per_ms);
        if self.bytes_egressed <= budget {
            return None;
        }
        let over_budget = self.bytes_egressed - budget;
        // Round up so a retry after the delay is never still over budget.
        let delay_ms = over_budget.div_ceil(self.bytes_per_ms);
        Some(Duration::from_millis(delay_ms))
    }

    /// Restart the epoch, forgiving past egress. Called on resume.
    pub fn reset(&mut self, now: Instant) {
        self.epoch = Some(now);
        self.bytes_egressed = 0;
    }
}
