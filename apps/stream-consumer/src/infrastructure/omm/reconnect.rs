//! Retry Policy
//!
//! Bounded exponential backoff with jitter. The session uses one policy for
//! transport reconnects and another for token renewal retries; both are
//! reset after a success.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::RetrySettings;

/// Largest jitter fraction applied; larger settings are capped.
const MAX_JITTER: f64 = 0.99;

/// Configuration for a backoff sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Number of retries before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Backoff for token renewal retries.
    #[must_use]
    pub const fn renewal() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 3,
        }
    }

    /// Build from configured retry settings.
    #[must_use]
    pub const fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            initial_delay: settings.initial_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
            jitter_factor: settings.jitter_factor,
            max_attempts: settings.max_attempts,
        }
    }

    /// Disable jitter (deterministic delays).
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Stateful backoff sequence.
///
/// # Example
///
/// ```rust
/// use stream_consumer::infrastructure::omm::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     max_attempts: 2,
///     ..ReconnectConfig::default().without_jitter()
/// });
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
/// assert_eq!(policy.next_delay(), None);
///
/// policy.reset();
/// assert!(policy.should_retry());
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy at its first attempt.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.jittered(self.current_delay);

        let grown = Duration::try_from_secs_f64(
            self.current_delay.as_secs_f64() * self.config.multiplier.max(1.0),
        )
        .unwrap_or(self.config.max_delay);
        self.current_delay = grown.min(self.config.max_delay);

        Some(delay)
    }

    /// Start over after a success.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Configured attempt limit (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Check whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter_factor;
        if !jitter.is_finite() || jitter <= 0.0 {
            return delay;
        }
        let jitter = jitter.min(MAX_JITTER);

        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(delay)
            .max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        })
    }

    #[test]
    fn default_is_bounded() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 5);
        assert!(ReconnectConfig::renewal().max_attempts > 0);
    }

    #[test]
    fn delays_grow_geometrically() {
        let mut policy = fixed(100, 10_000, 2.0, 0);

        let delays: Vec<_> = (0..4).filter_map(|_| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn delays_are_capped() {
        let mut policy = fixed(1000, 2000, 4.0, 0);

        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let mut policy = fixed(100, 1000, 2.0, 3);

        for expected in 1..=3 {
            assert!(policy.next_delay().is_some());
            assert_eq!(policy.attempt_count(), expected);
        }
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut policy = fixed(100, 10_000, 2.0, 3);
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..ReconnectConfig::default()
            });

            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn non_finite_settings_do_not_panic() {
        for (multiplier, jitter_factor) in [
            (f64::NAN, 0.1),
            (f64::INFINITY, 0.1),
            (2.0, f64::NAN),
            (2.0, f64::INFINITY),
            (2.0, 5.0),
        ] {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                multiplier,
                jitter_factor,
                max_attempts: 3,
            });

            for _ in 0..3 {
                let delay = policy.next_delay().unwrap();
                assert!(delay >= Duration::from_millis(1));
                assert!(delay <= Duration::from_secs(2));
            }
        }
    }

    #[test]
    fn unlimited_never_exhausts() {
        let mut policy = fixed(1, 10, 2.0, 0);
        for _ in 0..1000 {
            assert!(policy.next_delay().is_some());
        }
    }
}
