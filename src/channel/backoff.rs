//! Reconnect backoff policy
//!
//! wait(n) = min(base × decay^n, max), where n counts reconnects already
//! scheduled since the last successful open.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base_interval: Duration,
    max_interval: Duration,
    decay: f64,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_interval: Duration, max_interval: Duration, decay: f64) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_interval,
            max_interval,
            // decay below 1 would make waits shrink
            decay: if decay.is_finite() && decay >= 1.0 { decay } else { 1.0 },
        }
    }

    /// Wait before reconnect number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_interval.as_secs_f64() * 1000.0;
        let max_ms = self.max_interval.as_secs_f64() * 1000.0;
        let scaled = base_ms * self.decay.powi(attempt.min(i32::MAX as u32) as i32);
        let wait_ms = if scaled.is_finite() { scaled.min(max_ms) } else { max_ms };
        Duration::from_secs_f64(wait_ms / 1000.0)
    }

    /// Consume one attempt from the budget
    ///
    /// Returns the wait for this attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    /// Back to a full budget (after a successful open)
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            2,
            Duration::from_millis(1_000),
            Duration::from_millis(30_000),
            1.5,
        )
    }
}
