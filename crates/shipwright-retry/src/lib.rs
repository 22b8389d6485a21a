//! Backoff strategies for the build retry envelope.
//!
//! The orchestrator retries a host only for transient failures (timeouts
//! and build failures); everything else fails fast. Delays follow an
//! exponential curve with additive jitter so parallel targets retrying
//! against the same host do not thunder in step.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use shipwright_types::ErrorKind;

/// Default base delay between attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
/// Default cap on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
/// Default maximum attempts per host.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Upper bound of the additive jitter fraction (0–25 %).
const JITTER_FRACTION: f64 = 0.25;

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between attempts.
    Immediate,
    /// Delay doubles each attempt (default for builds).
    #[default]
    Exponential,
    /// Delay grows linearly (used by the downstream dispatcher).
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Configuration for one retry envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "shipwright_types::deserialize_duration",
        serialize_with = "shipwright_types::serialize_duration"
    )]
    #[serde(default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "shipwright_types::deserialize_duration",
        serialize_with = "shipwright_types::serialize_duration"
    )]
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,
    /// Additive jitter: the computed delay gains a random 0..=jitter
    /// fraction of itself.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

fn default_jitter() -> f64 {
    JITTER_FRACTION
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: JITTER_FRACTION,
        }
    }
}

impl RetryConfig {
    /// The build envelope: exponential, overridable through RETRY_MAX,
    /// RETRY_DELAY, and RETRY_MAX_DELAY.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(max) = env_u32("RETRY_MAX") {
            cfg.max_attempts = max;
        }
        if let Some(base) = env_duration("RETRY_DELAY") {
            cfg.base_delay = base;
        }
        if let Some(cap) = env_duration("RETRY_MAX_DELAY") {
            cfg.max_delay = cap;
        }
        cfg
    }

    /// The dispatcher envelope: 3 attempts, linear 5 s × attempt, no jitter.
    pub fn dispatch() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
            jitter: 0.0,
        }
    }

    /// Delay before retrying after `attempt` failures (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::Exponential => {
                let pow = attempt.saturating_sub(1).min(16);
                self.base_delay.saturating_mul(2_u32.saturating_pow(pow))
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Constant => self.base_delay,
        };
        let capped = raw.min(self.max_delay);
        apply_jitter(capped, self.jitter)
    }

    /// Whether another attempt is allowed after `attempts` tries so far.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Whether the orchestrator may retry a failure of this kind at all.
pub fn is_retryable(kind: &ErrorKind) -> bool {
    kind.retryable()
}

/// Add a random 0..=jitter fraction of the delay on top of it.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::random::<f64>() * jitter;
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

fn env_u32(key: &str) -> Option<u32> {
    env::var(key).ok()?.trim().parse().ok()
}

fn env_duration(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    let raw = raw.trim();
    // Accept bare seconds as well as humantime forms like "30s".
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).ok()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            strategy,
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_doubles_from_base() {
        let cfg = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(cfg.delay_for(1), Duration::from_secs(5));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(10));
        assert_eq!(cfg.delay_for(3), Duration::from_secs(20));
    }

    #[test]
    fn exponential_caps_at_max_delay() {
        let cfg = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(cfg.delay_for(10), Duration::from_secs(300));
        assert_eq!(cfg.delay_for(30), Duration::from_secs(300));
    }

    #[test]
    fn linear_grows_per_attempt() {
        let cfg = no_jitter(BackoffStrategy::Linear);
        assert_eq!(cfg.delay_for(1), Duration::from_secs(5));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(10));
        assert_eq!(cfg.delay_for(3), Duration::from_secs(15));
    }

    #[test]
    fn immediate_is_zero() {
        let cfg = no_jitter(BackoffStrategy::Immediate);
        assert_eq!(cfg.delay_for(1), Duration::ZERO);
        assert_eq!(cfg.delay_for(7), Duration::ZERO);
    }

    #[test]
    fn jitter_is_additive_and_bounded() {
        let cfg = RetryConfig {
            jitter: 0.25,
            ..no_jitter(BackoffStrategy::Constant)
        };
        for _ in 0..100 {
            let d = cfg.delay_for(1);
            assert!(d >= Duration::from_secs(5), "jitter must never shorten");
            assert!(d <= Duration::from_millis(6250), "jitter above 25%: {d:?}");
        }
    }

    #[test]
    fn can_retry_caps_attempts() {
        let cfg = no_jitter(BackoffStrategy::Exponential);
        assert!(cfg.can_retry(0));
        assert!(cfg.can_retry(2));
        assert!(!cfg.can_retry(3));
        assert!(!cfg.can_retry(4));
    }

    #[test]
    fn dispatch_envelope_is_linear_three_attempts() {
        let cfg = RetryConfig::dispatch();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.delay_for(1), Duration::from_secs(5));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(10));
    }

    #[test]
    fn retryability_follows_error_kind() {
        assert!(is_retryable(&ErrorKind::Timeout("t".into())));
        assert!(is_retryable(&ErrorKind::BuildFailure("b".into())));
        assert!(!is_retryable(&ErrorKind::DependencyMissing("docker".into())));
        assert!(!is_retryable(&ErrorKind::RateLimited("api".into())));
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        temp_env::with_vars(
            [
                ("RETRY_MAX", Some("5")),
                ("RETRY_DELAY", Some("2")),
                ("RETRY_MAX_DELAY", Some("1m")),
            ],
            || {
                let cfg = RetryConfig::from_env();
                assert_eq!(cfg.max_attempts, 5);
                assert_eq!(cfg.base_delay, Duration::from_secs(2));
                assert_eq!(cfg.max_delay, Duration::from_secs(60));
            },
        );
    }

    #[test]
    #[serial]
    fn env_defaults_when_unset() {
        temp_env::with_vars(
            [
                ("RETRY_MAX", None::<&str>),
                ("RETRY_DELAY", None),
                ("RETRY_MAX_DELAY", None),
            ],
            || {
                let cfg = RetryConfig::from_env();
                assert_eq!(cfg.max_attempts, DEFAULT_MAX_ATTEMPTS);
                assert_eq!(cfg.base_delay, DEFAULT_BASE_DELAY);
                assert_eq!(cfg.max_delay, DEFAULT_MAX_DELAY);
            },
        );
    }
}
