//! Reconnection policy
//!
//! Delays grow geometrically from `min_delay` to `max_delay`. Every connection
//! attempt counts toward `attempt_limit`, including the first one, and the
//! counters reset when a channel reaches `Ready`.
//!
//! Endpoint rotation is handled separately by [`ConnectionCursor`], which walks
//! a channel's connection list round-robin.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::types::serde_millis;

/// Backoff parameters for a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "serde_millis")]
    pub min_delay: Duration,
    #[serde(with = "serde_millis")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// `None` retries forever
    pub attempt_limit: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            attempt_limit: None,
        }
    }
}

impl ReconnectConfig {
    /// Short delays for tests
    pub fn testing() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            attempt_limit: Some(3),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay > self.max_delay {
            return Err(ConfigError::invalid(format!(
                "reconnect min_delay ({:?}) exceeds max_delay ({:?})",
                self.min_delay, self.max_delay
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(format!(
                "reconnect backoff_factor must be finite and >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Attempt counter and delay progression for one channel
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
            current_delay: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Count a connection attempt
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Advance the delay and decide whether another attempt is allowed
    pub fn record_failure(&mut self) -> ReconnectDecision {
        let delay = self.advance_delay();
        if self.is_exhausted() {
            ReconnectDecision::GiveUp
        } else {
            ReconnectDecision::Retry { delay }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.config
            .attempt_limit
            .is_some_and(|limit| self.attempts >= limit)
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    fn advance_delay(&mut self) -> Duration {
        let grown = Duration::try_from_secs_f64(
            self.current_delay.as_secs_f64() * self.config.backoff_factor,
        )
        .unwrap_or(self.config.max_delay);
        self.current_delay = grown.max(self.config.min_delay).min(self.config.max_delay);
        self.current_delay
    }
}

// ----------------------------------------------------------------------------
// Endpoint Rotation
// ----------------------------------------------------------------------------

/// Round-robin position in a channel's connection list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCursor {
    len: usize,
    index: usize,
}

impl ConnectionCursor {
    pub fn new(len: usize) -> Self {
        Self { len, index: 0 }
    }

    pub fn current(&self) -> usize {
        self.index
    }

    /// Move to the next entry, wrapping at the end
    pub fn advance(&mut self) -> usize {
        if self.len > 0 {
            self.index = (self.index + 1) % self.len;
        }
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn create_test_config(limit: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_factor: 2.0,
            attempt_limit: limit,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_max() {
        let mut policy = ReconnectPolicy::new(create_test_config(None));
        let mut delays = Vec::new();
        for _ in 0..5 {
            policy.record_attempt();
            match policy.record_failure() {
                ReconnectDecision::Retry { delay } => delays.push(delay.as_secs()),
                ReconnectDecision::GiveUp => panic!("unlimited policy gave up"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 4, 4]);
    }

    #[test]
    fn test_limit_counts_initial_attempt() {
        let mut policy = ReconnectPolicy::new(create_test_config(Some(3)));
        let mut decisions = Vec::new();
        for _ in 0..3 {
            policy.record_attempt();
            decisions.push(policy.record_failure());
        }
        assert_eq!(
            decisions,
            vec![
                ReconnectDecision::Retry {
                    delay: Duration::from_secs(1)
                },
                ReconnectDecision::Retry {
                    delay: Duration::from_secs(2)
                },
                ReconnectDecision::GiveUp,
            ]
        );
        assert_eq!(policy.current_delay(), Duration::from_secs(4));
        assert!(policy.is_exhausted());
    }

    #[test]
    fn test_zero_limit_never_retries() {
        let mut policy = ReconnectPolicy::new(create_test_config(Some(0)));
        policy.record_attempt();
        assert_eq!(policy.record_failure(), ReconnectDecision::GiveUp);
    }

    #[test]
    fn test_reset_restarts_progression() {
        let mut policy = ReconnectPolicy::new(create_test_config(Some(3)));
        policy.record_attempt();
        policy.record_failure();
        policy.record_attempt();
        policy.record_failure();
        policy.reset();

        assert_eq!(policy.attempts(), 0);
        policy.record_attempt();
        assert_eq!(
            policy.record_failure(),
            ReconnectDecision::Retry {
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(ReconnectConfig::default().validate().is_ok());

        let mut config = create_test_config(None);
        config.min_delay = Duration::from_secs(10);
        assert!(config.validate().is_err());

        let mut config = create_test_config(None);
        config.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        config.backoff_factor = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cursor_wraps() {
        let mut cursor = ConnectionCursor::new(2);
        assert_eq!(cursor.current(), 0);
        assert_eq!(cursor.advance(), 1);
        assert_eq!(cursor.advance(), 0);

        let mut empty = ConnectionCursor::new(0);
        assert_eq!(empty.advance(), 0);
    }

    proptest! {
        #[test]
        fn prop_delays_bounded_and_monotonic(
            min_ms in 1u64..1_000,
            spread in 0u64..10_000,
            factor in 1.0f64..4.0,
            failures in 1usize..32,
        ) {
            let config = ReconnectConfig {
                min_delay: Duration::from_millis(min_ms),
                max_delay: Duration::from_millis(min_ms + spread),
                backoff_factor: factor,
                attempt_limit: None,
            };
            let mut policy = ReconnectPolicy::new(config.clone());
            let mut previous = Duration::ZERO;
            for _ in 0..failures {
                policy.record_attempt();
                let ReconnectDecision::Retry { delay } = policy.record_failure() else {
                    return Err(TestCaseError::fail("unlimited policy gave up"));
                };
                prop_assert!(delay >= config.min_delay);
                prop_assert!(delay <= config.max_delay);
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
