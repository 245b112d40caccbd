//! Retry policies for transient device errors.
//!
//! A [`RetryPolicy`] decides how often a failed frame read is repeated, when a
//! diagnostic is raised, and how long to wait between attempts. The default
//! policy mirrors the behaviour operators expect from flaky USB spectrometers:
//! retry immediately and forever, warning once the failures pile up.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consecutive transient failures tolerated before each further failure is reported.
pub const DEFAULT_DIAGNOSTIC_THRESHOLD: u32 = 5;

/// Defines a policy for retrying a frame read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The maximum number of consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Failures beyond this count emit a "Read error" diagnostic.
    pub diagnostic_threshold: u32,
    /// The delay between retry attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            diagnostic_threshold: DEFAULT_DIAGNOSTIC_THRESHOLD,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    /// Retries forever without delay.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Gives up after `max_attempts` consecutive failures.
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    /// Replaces the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether `failures` consecutive failures exhaust the policy.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }

    /// Whether the failure numbered `failures` (1-based) warrants a diagnostic.
    pub fn should_report(&self, failures: u32) -> bool {
        failures > self.diagnostic_threshold
    }
}

/// Delay strategy between consecutive attempts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same delay after every failure.
    Fixed {
        /// Delay between attempts.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Double the delay after every failure, capped at `max`.
    Exponential {
        /// Delay after the first failure.
        #[serde(with = "humantime_serde")]
        initial: Duration,
        /// Upper bound on the delay.
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl Backoff {
    /// Delay to apply after the failure numbered `failures` (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { initial, max } => {
                let shift = failures.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_unbounded() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(u32::MAX));
        assert!(!policy.should_report(5));
        assert!(policy.should_report(6));
    }

    #[test]
    fn test_bounded_policy() {
        let policy = RetryPolicy::bounded(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(40));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(50));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_from_toml_style_fields() {
        let backoff: Backoff =
            serde_json::from_str(r#"{"kind":"fixed","delay":"25ms"}"#).unwrap();
        assert_eq!(
            backoff,
            Backoff::Fixed {
                delay: Duration::from_millis(25)
            }
        );
    }
}
