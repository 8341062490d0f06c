//! Retry policy with exponential backoff for transient errors.
//!
//! Ops never sleep in place: a transient failure schedules the op's
//! `next_retry_at` and the op goes back to Pending until that time.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts after which an op is given up.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%, 0 disables).
    pub jitter: f64,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set relative jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after the `attempt`-th consecutive failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter > 0.0 {
            let jitter_factor = 1.0 - self.jitter + rand::random::<f64>() * 2.0 * self.jitter;
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }

    /// When an op that has failed `attempts` times becomes eligible again.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.delay_for_attempt(attempts)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether `attempts` failures use up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(8)
            .with_initial_delay(Duration::from_secs(2))
            .with_backoff_multiplier(2.0)
            .with_jitter(0.0);

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(0.0);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::default();
        for _ in 0..200 {
            let delay = config.delay_for_attempt(1).as_millis();
            assert!((1600..=2400).contains(&delay), "{}", delay);
        }
    }

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.initial_delay, Duration::from_secs(2));
        assert_eq!(config.max_delay, Duration::from_secs(300));
        assert!(!config.exhausted(7));
        assert!(config.exhausted(8));
    }

    #[test]
    fn test_next_retry_at() {
        let config = RetryConfig::default().with_jitter(0.0);
        let now = Utc::now();
        assert_eq!(config.next_retry_at(2, now), now + TimeDelta::seconds(4));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 3}"#).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_multiplier, 2.0);
    }
}
