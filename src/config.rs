//! Stats engine configuration.

use crate::error::{Result, SubscriptionError};
use crate::governor::{FailurePolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on worker threads for a single request.
pub const DEFAULT_CONCURRENCY_CEILING: usize = 32;

/// Stats engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Wall-clock budget for one stats request.
    /// Default: 5s
    #[serde(with = "millis")]
    pub deadline: Duration,

    /// Max event-type workers per request; the actual count is
    /// `min(event types, max_concurrency)`.
    /// Default: 32
    pub max_concurrency: usize,

    /// Max concurrent timestamp lookups inside one event-type task.
    /// Default: 8
    pub timelag_concurrency: usize,

    /// Retry policy applied to every collaborator call.
    pub retry: RetryPolicy,

    /// Partial-versus-failed thresholds and stale tolerance.
    pub failure: FailurePolicy,

    /// Retry delay suggested to callers on retryable failures.
    /// Default: 1s
    #[serde(with = "millis")]
    pub retry_after: Duration,

    /// Cached message timestamps (0 disables the cache).
    /// Default: 10_000
    pub timestamp_cache_size: usize,

    /// Event types whose last partition layout is remembered for
    /// reporting failed event types (0 remembers none).
    /// Default: 10_000
    pub topology_cache_size: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5),
            max_concurrency: DEFAULT_CONCURRENCY_CEILING,
            timelag_concurrency: 8,
            retry: RetryPolicy::default(),
            failure: FailurePolicy::default(),
            retry_after: Duration::from_secs(1),
            timestamp_cache_size: 10_000,
            topology_cache_size: 10_000,
        }
    }
}

impl StatsConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StatsConfig = serde_json::from_str(json)
            .map_err(|e| SubscriptionError::InvalidRequest(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SubscriptionError::InvalidRequest(msg.to_string()));

        if self.deadline.is_zero() {
            return invalid("deadline must be positive");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1");
        }
        if self.timelag_concurrency == 0 {
            return invalid("timelag_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier must be >= 1.0");
        }
        for (name, ratio) in [
            ("failure.max_failed_ratio", self.failure.max_failed_ratio),
            ("failure.max_inconsistent_ratio", self.failure.max_inconsistent_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(SubscriptionError::InvalidRequest(format!(
                    "{} must be within [0, 1], got {}",
                    name, ratio
                )));
            }
        }
        Ok(())
    }

    /// Worker threads for a request over `event_types` event types.
    pub fn worker_count(&self, event_types: usize) -> usize {
        event_types.min(self.max_concurrency).max(1)
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StatsConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.max_concurrency, 32);
    }

    #[test]
    fn test_from_json_overrides_and_defaults() {
        let config = StatsConfig::from_json(
            r#"{
                "deadline": 250,
                "retry": { "max_attempts": 5, "initial_backoff": 10 },
                "failure": { "max_failed_ratio": 0.25 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.deadline, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.retry.max_backoff, RetryPolicy::default().max_backoff);
        assert_eq!(config.failure.max_failed_ratio, 0.25);
        assert!(config.failure.fail_on_permanent);
        assert_eq!(config.timestamp_cache_size, 10_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(StatsConfig::from_json(r#"{ "deadline": 0 }"#).is_err());
        assert!(StatsConfig::from_json(r#"{ "max_concurrency": 0 }"#).is_err());
        assert!(StatsConfig::from_json(r#"{ "failure": { "max_failed_ratio": 1.5 } }"#).is_err());
        assert!(StatsConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_worker_count_is_capped() {
        let config = StatsConfig::default();
        assert_eq!(config.worker_count(0), 1);
        assert_eq!(config.worker_count(3), 3);
        assert_eq!(config.worker_count(500), DEFAULT_CONCURRENCY_CEILING);
    }
}
