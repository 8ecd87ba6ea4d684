//! Retry policy with exponential backoff and jitter.

use super::cancel::CancellationToken;
use crate::config::millis;
use crate::error::SourceError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Fraction (0.0-1.0) of each delay randomized up or down.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: interval,
            max_backoff: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-based), without jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()).max(0.0))
    }

    /// Delay to wait after the `attempt`-th failure, with jitter applied.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base * (1.0 + factor)).max(0.0))
    }

    /// Sleep out the backoff after the `attempt`-th failure.
    ///
    /// Returns `false` if the token was cancelled before the delay elapsed.
    pub fn backoff(&self, attempt: usize, token: &CancellationToken) -> bool {
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            return !token.is_cancelled();
        }
        !token.wait_timeout(delay)
    }
}

/// Why a retried operation gave up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryError {
    /// Failure that retrying cannot fix.
    Permanent(SourceError),
    /// Every attempt failed transiently.
    Exhausted { attempts: usize, last: SourceError },
    /// The request was cancelled between attempts.
    Cancelled,
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or
/// `token` is cancelled.
pub fn retry<T, F>(
    what: &str,
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Result<T, SourceError>,
{
    let mut attempts = 0;
    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempts += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err @ SourceError::NotFound(_)) => return Err(RetryError::Permanent(err)),
            Err(err) => {
                if !policy.should_retry(attempts) {
                    return Err(RetryError::Exhausted { attempts, last: err });
                }
                tracing::debug!(
                    operation = what,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "retrying after transient failure"
                );
                if !policy.backoff(attempts, token) {
                    return Err(RetryError::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            jitter: 0.5,
            initial_backoff: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(49), "{:?}", delay);
            assert!(delay <= Duration::from_millis(151), "{:?}", delay);
        }
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = retry("test", &quick(3), &CancellationToken::new(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SourceError::Unavailable("flaky".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_exhausts_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry("test", &quick(3), &CancellationToken::new(), || {
            calls.set(calls.get() + 1);
            Err(SourceError::Unavailable("down".into()))
        });
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: SourceError::Unavailable("down".into())
            })
        );
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_not_found_is_never_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry("test", &quick(5), &CancellationToken::new(), || {
            calls.set(calls.get() + 1);
            Err(SourceError::NotFound("orders".into()))
        });
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cancelled_token_stops_retries() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Cell::new(0);
        let result: Result<(), _> = retry("test", &quick(5), &token, || {
            calls.set(calls.get() + 1);
            Ok(())
        });
        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.get(), 0);
    }
}
