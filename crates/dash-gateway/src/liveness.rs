//! Liveness watchdog driven by server ticks.
//!
//! The server advertises `tickIntervalMs` in hello-ok. Any inbound frame
//! counts as proof of life; after `tolerance` silent intervals the
//! connection is treated as lost.

use std::time::Duration;

use tokio::time::Instant;

/// Intervals of silence tolerated before the connection is declared dead.
pub const DEFAULT_TOLERANCE: u32 = 2;

/// Tracks when the server was last heard from.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    last_seen: Instant,
    tick_interval: Duration,
    tolerance: u32,
}

impl LivenessMonitor {
    /// Start watching with the given tick interval.
    #[must_use]
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            last_seen: Instant::now(),
            tick_interval,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Override the number of tolerated silent intervals (minimum 1).
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: u32) -> Self {
        self.tolerance = tolerance.max(1);
        self
    }

    /// Record inbound traffic.
    pub fn observe(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Instant after which the connection counts as lost.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_seen + self.tick_interval * self.tolerance
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Whole tick intervals elapsed since the last frame.
    #[must_use]
    pub fn missed_ticks(&self, now: Instant) -> u32 {
        let silent = now.saturating_duration_since(self.last_seen);
        if self.tick_interval.is_zero() {
            return 0;
        }
        u32::try_from(silent.as_nanos() / self.tick_interval.as_nanos()).unwrap_or(u32::MAX)
    }

    /// The advertised tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        self.tick_interval
    }
}
