//! Availability governor for stats requests.
//!
//! The governor owns every decision about unreliable collaborators:
//! - Classifying failures as transient, permanent, or stale
//! - Retrying with exponential backoff and jitter
//! - The shared per-request deadline and its cancellation token
//! - Turning a join summary into `COMPLETE`, `PARTIAL` or a typed failure

mod cancel;
mod policy;
mod retry;

pub use cancel::{CancellationToken, Deadline};
pub use policy::{
    detect_stale, FailureClass, FailurePolicy, JoinSummary, RequestState, RequestTracker,
    StaleReport, Verdict,
};
pub use retry::{retry, RetryError, RetryPolicy};

use crate::config::StatsConfig;
use crate::error::{Result, SourceError, SubscriptionError};
use crate::types::{PartitionOffset, StatsOutcome, SubscriptionId};
use std::time::Duration;

/// Applies retry, deadline and failure-threshold policy.
#[derive(Clone, Debug)]
pub struct AvailabilityGovernor {
    retry: RetryPolicy,
    failure: FailurePolicy,
    deadline: Duration,
    retry_after: Duration,
}

impl AvailabilityGovernor {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            failure: config.failure.clone(),
            deadline: config.deadline,
            retry_after: config.retry_after,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn failure_policy(&self) -> &FailurePolicy {
        &self.failure
    }

    pub fn classify(&self, err: &SourceError) -> FailureClass {
        FailureClass::of(err)
    }

    /// `Some(StaleSnapshot)` if a reading should not be trusted as is.
    pub fn classify_reading(&self, report: &StaleReport) -> Option<FailureClass> {
        FailureClass::of_reading(report)
    }

    /// Start the clock for a new request.
    pub fn begin(&self) -> (CancellationToken, Deadline) {
        (CancellationToken::new(), Deadline::after(self.deadline))
    }

    /// Whether another attempt may follow `attempts` attempts.
    pub fn should_retry(&self, attempts: usize) -> bool {
        self.retry.should_retry(attempts)
    }

    /// Wait out the backoff after the `attempt`-th failure.
    /// Returns `false` if the request was cancelled meanwhile.
    pub fn backoff(&self, attempt: usize, token: &CancellationToken) -> bool {
        self.retry.backoff(attempt, token)
    }

    /// Retry a single collaborator call under this governor's policy.
    pub fn retry<T, F>(
        &self,
        what: &str,
        token: &CancellationToken,
        op: F,
    ) -> std::result::Result<T, RetryError>
    where
        F: FnMut() -> std::result::Result<T, SourceError>,
    {
        retry(what, &self.retry, token, op)
    }

    pub fn detect_stale<'a, I>(&self, offsets: I) -> StaleReport
    where
        I: IntoIterator<Item = &'a PartitionOffset>,
    {
        detect_stale(offsets, self.failure.stale_tolerance)
    }

    /// Map a join summary to the request result.
    pub fn verdict(
        &self,
        subscription: &SubscriptionId,
        summary: &JoinSummary,
    ) -> Result<StatsOutcome> {
        match self.failure.evaluate(summary) {
            Verdict::Succeeded(outcome) => Ok(outcome),
            Verdict::NotFound { event_type } => Err(SubscriptionError::EventTypeNotFound {
                subscription: subscription.clone(),
                event_type,
            }),
            Verdict::Unavailable { reason } => Err(SubscriptionError::TemporarilyUnavailable {
                subscription: subscription.clone(),
                reason,
                retry_after: self.retry_after,
            }),
            Verdict::Inconsistent { event_types } => Err(SubscriptionError::Inconsistent {
                subscription: subscription.clone(),
                event_types,
                retry_after: self.retry_after,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_verdict_maps_to_error_kinds() {
        let governor = AvailabilityGovernor::new(&StatsConfig::default());
        let id = SubscriptionId::from("S1");

        let summary = JoinSummary {
            total: 2,
            resolved: 0,
            failed: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        let err = governor.verdict(&id, &summary).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemporarilyUnavailable);
        assert_eq!(err.retry_after(), Some(StatsConfig::default().retry_after));

        let summary = JoinSummary {
            total: 2,
            resolved: 1,
            permanent: vec!["gone".to_string()],
            ..Default::default()
        };
        let err = governor.verdict(&id, &summary).unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::EventTypeNotFound { ref event_type, .. } if event_type == "gone"
        ));

        let summary = JoinSummary {
            total: 1,
            resolved: 1,
            inconsistent: vec!["a".to_string()],
            degraded: 1,
            ..Default::default()
        };
        let err = governor.verdict(&id, &summary).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inconsistent);
    }

    #[test]
    fn test_begin_uses_configured_deadline() {
        let config = StatsConfig {
            deadline: Duration::from_secs(60),
            ..StatsConfig::default()
        };
        let governor = AvailabilityGovernor::new(&config);
        let (token, deadline) = governor.begin();
        assert!(!token.is_cancelled());
        assert!(deadline.remaining() > Duration::from_secs(50));
    }
}
