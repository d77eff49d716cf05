//! Liveness tracking from message timestamps
//!
//! Staleness is judged from inbound traffic only; the socket's own state is
//! not consulted.

use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a keep-alive tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveVerdict {
    /// Nothing received for longer than the staleness timeout
    Stale,
    /// Nothing sent for a full interval; caller may send a ping
    SendPing,
    Healthy,
}

#[derive(Debug, Clone)]
pub struct KeepAliveMonitor {
    last_received: Instant,
    last_sent: Instant,
    interval: Duration,
    timeout: Duration,
}

impl KeepAliveMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            last_received: now,
            last_sent: now,
            interval,
            timeout,
        }
    }

    pub fn record_received(&mut self, at: Instant) {
        self.last_received = at;
    }

    pub fn record_sent(&mut self, at: Instant) {
        self.last_sent = at;
    }

    /// Restart both clocks (on a fresh open)
    pub fn reset(&mut self, at: Instant) {
        self.last_received = at;
        self.last_sent = at;
    }

    pub fn check(&self, now: Instant) -> KeepAliveVerdict {
        if now.saturating_duration_since(self.last_received) > self.timeout {
            KeepAliveVerdict::Stale
        } else if now.saturating_duration_since(self.last_sent) >= self.interval {
            KeepAliveVerdict::SendPing
        } else {
            KeepAliveVerdict::Healthy
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn since_received(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> KeepAliveMonitor {
        KeepAliveMonitor::new(Duration::from_millis(5_000), Duration::from_millis(15_000))
    }

    #[test]
    fn test_silence_beyond_timeout_is_stale() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.reset(t0);

        assert_eq!(m.check(t0 + Duration::from_millis(16_000)), KeepAliveVerdict::Stale);
    }

    #[test]
    fn test_exactly_at_timeout_is_not_stale() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.reset(t0);

        assert_ne!(m.check(t0 + Duration::from_millis(15_000)), KeepAliveVerdict::Stale);
    }

    #[test]
    fn test_quiet_outbound_requests_ping() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.reset(t0);
        m.record_received(t0 + Duration::from_millis(4_000));

        assert_eq!(m.check(t0 + Duration::from_millis(5_000)), KeepAliveVerdict::SendPing);
    }

    #[test]
    fn test_recent_traffic_is_healthy() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.reset(t0);
        m.record_sent(t0 + Duration::from_millis(3_000));
        m.record_received(t0 + Duration::from_millis(3_500));

        assert_eq!(m.check(t0 + Duration::from_millis(6_000)), KeepAliveVerdict::Healthy);
    }

    #[test]
    fn test_received_traffic_clears_staleness() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.reset(t0);
        m.record_received(t0 + Duration::from_millis(10_000));

        assert_ne!(m.check(t0 + Duration::from_millis(16_000)), KeepAliveVerdict::Stale);
        assert_eq!(
            m.since_received(t0 + Duration::from_millis(16_000)),
            Duration::from_millis(6_000)
        );
    }
}
