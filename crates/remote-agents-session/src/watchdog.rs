//! Processing watchdog.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks time since the last inbound frame of an outstanding request.
#[derive(Debug, Default)]
pub struct Watchdog {
    last_response: Option<Instant>,
}

impl Watchdog {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_response: None,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.last_response = Some(now);
    }

    /// Record progress. Ignored while disarmed.
    pub fn touch(&mut self, now: Instant) {
        if let Some(last) = self.last_response.as_mut() {
            *last = now;
        }
    }

    pub fn disarm(&mut self) {
        self.last_response = None;
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.last_response.is_some()
    }

    /// Whether the request has been silent for at least `timeout`.
    #[must_use]
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.last_response
            .is_some_and(|last| now.saturating_duration_since(last) >= timeout)
    }
}
