//! Reconnection backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::Timing;

/// Exponential backoff with jitter for reconnect attempts.
///
/// `delay(n) = base * 2^(min(n, cap) - 1) + jitter`, jitter uniform in
/// `[0, jitter_max)`. Growth stops at the cap attempt; the attempt number
/// itself keeps counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    growth_cap: u32,
    jitter_max: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn new(base: Duration, growth_cap: u32, jitter_max: Duration) -> Self {
        Self {
            base,
            growth_cap,
            jitter_max,
        }
    }

    #[must_use]
    pub const fn from_timing(timing: &Timing) -> Self {
        Self::new(
            timing.reconnect_base,
            timing.reconnect_growth_cap,
            timing.reconnect_jitter,
        )
    }

    /// Delay before reconnect `attempt` (1-based), without jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.clamp(1, self.growth_cap.max(1)) - 1;
        self.base.saturating_mul(1_u32 << exponent.min(31))
    }

    /// Delay before reconnect `attempt` with an explicit jitter.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.backoff(attempt) + jitter.min(self.jitter_max)
    }

    /// Delay before reconnect `attempt` with random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_max.is_zero() {
            Duration::ZERO
        } else {
            rand::rng().random_range(Duration::ZERO..self.jitter_max)
        };
        self.delay_with_jitter(attempt, jitter)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_timing(&Timing::default())
    }
}
