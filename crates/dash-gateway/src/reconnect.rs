//! Reconnection policy and exponential backoff.
//!
//! The [`Reconnector`] never loops on its own: the connection calls
//! [`Reconnector::schedule_retry`] after each failure and receives a
//! [`ReconnectSignal::RetryNow`] on its channel when the delay elapses.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::diagnostics::{Category, DiagnosticLog};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    /// Whether to reconnect at all after a connection loss.
    pub enabled: bool,
    /// Maximum number of attempts per outage (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before the first attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any delay.
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Fraction of the gap to the next step that may be added at random.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered delay for `attempt` (1-based), uncapped.
    fn raw_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.base_delay_ms as f64 * self.multiplier.powi(exponent)
    }

    /// Delay before `attempt`, with `unit` in `[0, 1)` drawn by the caller.
    ///
    /// Jitter only reaches into the gap between this step and the next, so
    /// the sequence stays non-decreasing for any draw.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, unit: f64) -> Duration {
        let low = self.raw_delay_ms(attempt);
        let high = self.raw_delay_ms(attempt.saturating_add(1));
        let jitter = self.jitter.clamp(0.0, 1.0) * unit.clamp(0.0, 1.0);
        let delay = (low + jitter * (high - low)).min(self.max_delay_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Whether attempt number `attempt` (1-based) is permitted.
    #[must_use]
    pub const fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}

/// Message sent to the connection when a scheduled delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectSignal {
    /// Start the next connection attempt.
    RetryNow {
        /// 1-based attempt number within the current outage.
        attempt: u32,
    },
}

/// Reconnector counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectMetrics {
    /// Attempts in the current outage.
    pub attempts: u32,
    /// Last delay used.
    pub last_delay_ms: Option<u64>,
    /// Outages that ended in a successful reconnection.
    pub total_reconnections: u64,
}

/// Schedules reconnection attempts.
#[derive(Debug)]
pub struct Reconnector {
    config: ReconnectConfig,
    attempts: u32,
    last_delay: Option<Duration>,
    total_reconnections: u64,
    timer: Option<AbortHandle>,
    diagnostics: Arc<DiagnosticLog>,
}

impl Reconnector {
    /// Create a reconnector with no attempts made.
    #[must_use]
    pub fn new(config: ReconnectConfig, diagnostics: Arc<DiagnosticLog>) -> Self {
        Self {
            config,
            attempts: 0,
            last_delay: None,
            total_reconnections: 0,
            timer: None,
            diagnostics,
        }
    }

    /// Count an attempt and emit [`ReconnectSignal::RetryNow`] on `signal`
    /// after the backoff delay.
    ///
    /// Returns `None` without scheduling when reconnection is disabled or
    /// the attempt budget is spent.
    pub fn schedule_retry(
        &mut self,
        signal: mpsc::UnboundedSender<ReconnectSignal>,
    ) -> Option<Duration> {
        if !self.config.enabled {
            return None;
        }

        let attempt = self.attempts.saturating_add(1);
        if !self.config.allows_attempt(attempt) {
            self.diagnostics.warn(
                Category::Reconnect,
                "reconnect attempts exhausted",
                Some(json!({"attempts": self.attempts})),
            );
            return None;
        }

        self.attempts = attempt;
        let delay = self
            .config
            .delay_for_attempt(attempt, rand::thread_rng().r#gen::<f64>());
        self.last_delay = Some(delay);
        self.cancel();

        let delay_ms = millis(delay);
        self.diagnostics.info(
            Category::Reconnect,
            format!("retry {attempt} in {delay_ms}ms"),
            Some(json!({"attempt": attempt, "delayMs": delay_ms})),
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signal.send(ReconnectSignal::RetryNow { attempt });
        });
        self.timer = Some(handle.abort_handle());
        Some(delay)
    }

    /// Record a successful connection; the next failure starts from the
    /// base delay again.
    pub fn reset(&mut self) {
        if self.attempts > 0 {
            self.total_reconnections += 1;
            self.diagnostics.info(
                Category::Reconnect,
                format!("reconnected after {} attempts", self.attempts),
                None,
            );
        }
        self.attempts = 0;
        self.cancel();
    }

    /// Abort any scheduled attempt.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Attempts in the current outage.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> ReconnectMetrics {
        ReconnectMetrics {
            attempts: self.attempts,
            last_delay_ms: self.last_delay.map(millis),
            total_reconnections: self.total_reconnections,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed(base: u64, max: u64) -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            jitter: 0.0,
            ..ReconnectConfig::default()
        }
    }

    fn reconnector(config: ReconnectConfig) -> Reconnector {
        Reconnector::new(config, Arc::new(DiagnosticLog::default()))
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert!(config.enabled);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: ReconnectConfig =
            serde_json::from_str(r#"{"maxAttempts": 3, "baseDelayMs": 250}"#).unwrap();
        assert_eq!(config.max_attempts, Some(3));
        assert_eq!(config.base_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn test_delay_for_attempt_without_jitter() {
        let config = fixed(1000, 30_000);
        let delays: Vec<u64> = (1..=7)
            .map(|n| u64::try_from(config.delay_for_attempt(n, 0.5).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_jitter_stays_below_next_step() {
        let config = ReconnectConfig {
            jitter: 1.0,
            ..fixed(100, 10_000)
        };
        let d = config.delay_for_attempt(2, 0.999);
        assert!(d >= Duration::from_millis(200));
        assert!(d <= Duration::from_millis(400));
    }

    #[test]
    fn test_allows_attempt() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert!(config.allows_attempt(1));
        assert!(config.allows_attempt(3));
        assert!(!config.allows_attempt(4));
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_bounded(
            base in 1u64..5_000,
            extra in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..=1.0,
            draws in proptest::collection::vec(0.0f64..1.0, 1..20),
        ) {
            let config = ReconnectConfig {
                enabled: true,
                max_attempts: None,
                base_delay_ms: base,
                max_delay_ms: base + extra,
                multiplier,
                jitter,
            };
            let mut previous = Duration::ZERO;
            for (i, unit) in draws.iter().enumerate() {
                let attempt = u32::try_from(i + 1).unwrap();
                let delay = config.delay_for_attempt(attempt, *unit);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(config.max_delay_ms));
                previous = delay;
            }
        }
    }

    #[tokio::test]
    async fn test_schedule_retry_emits_signal() {
        let mut r = reconnector(fixed(5, 50));
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(r.schedule_retry(tx), Some(Duration::from_millis(5)));
        assert_eq!(rx.recv().await, Some(ReconnectSignal::RetryNow { attempt: 1 }));
        assert_eq!(r.metrics().attempts, 1);
        assert_eq!(r.metrics().last_delay_ms, Some(5));
    }

    #[tokio::test]
    async fn test_reset_restarts_at_base() {
        let mut r = reconnector(fixed(5, 1000));
        let (tx, _rx) = mpsc::unbounded_channel();

        r.schedule_retry(tx.clone());
        r.schedule_retry(tx.clone());
        assert_eq!(r.schedule_retry(tx.clone()), Some(Duration::from_millis(20)));

        r.reset();
        assert_eq!(r.metrics().total_reconnections, 1);
        assert_eq!(r.schedule_retry(tx), Some(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_exhausted_attempts() {
        let mut r = reconnector(ReconnectConfig {
            max_attempts: Some(2),
            ..fixed(1, 10)
        });
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(r.schedule_retry(tx.clone()).is_some());
        assert!(r.schedule_retry(tx.clone()).is_some());
        assert!(r.schedule_retry(tx).is_none());
        assert_eq!(r.attempts(), 2);
    }

    #[tokio::test]
    async fn test_disabled_never_schedules() {
        let mut r = reconnector(ReconnectConfig {
            enabled: false,
            ..ReconnectConfig::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(r.schedule_retry(tx).is_none());
        assert_eq!(r.attempts(), 0);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_signal() {
        let mut r = reconnector(fixed(20, 20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        r.schedule_retry(tx);
        r.cancel();
        let got = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
        assert!(matches!(got, Ok(None) | Err(_)));
    }
}
