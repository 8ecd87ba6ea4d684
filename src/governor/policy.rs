//! Failure classification, staleness detection and the request verdict.

use crate::config::millis;
use crate::error::SourceError;
use crate::types::{PartitionId, PartitionOffset, StatsOutcome, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// How a collaborator failure is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Network or timeout trouble; retried.
    Transient,
    /// The event type does not exist; propagated without retry.
    Permanent,
    /// Partition snapshots disagree in freshness beyond the tolerance.
    StaleSnapshot,
}

impl FailureClass {
    pub fn of(err: &SourceError) -> Self {
        match err {
            SourceError::Unavailable(_) => FailureClass::Transient,
            SourceError::NotFound(_) => FailureClass::Permanent,
        }
    }

    /// Classify a successful reading: `StaleSnapshot` when most of its
    /// partitions are stale.
    pub fn of_reading(report: &StaleReport) -> Option<Self> {
        report.is_majority().then_some(FailureClass::StaleSnapshot)
    }
}

/// Thresholds separating a partial answer from a failed request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Fail the request as soon as any event type is permanently missing.
    pub fail_on_permanent: bool,
    /// Largest tolerated fraction of event types that failed outright.
    /// The request fails when the fraction is strictly greater.
    pub max_failed_ratio: f64,
    /// Largest tolerated fraction of inconsistent event types.
    pub max_inconsistent_ratio: f64,
    /// Snapshot-time spread within one event type that is still considered
    /// a coherent reading.
    #[serde(with = "millis")]
    pub stale_tolerance: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            fail_on_permanent: true,
            max_failed_ratio: 0.5,
            max_inconsistent_ratio: 0.5,
            stale_tolerance: Duration::from_secs(30),
        }
    }
}

/// Partitions whose snapshot lags the freshest one by more than the tolerance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaleReport {
    pub stale: BTreeSet<PartitionId>,
    pub total: usize,
}

impl StaleReport {
    /// More than half of the partitions are stale.
    pub fn is_majority(&self) -> bool {
        self.total > 0 && self.stale.len() * 2 > self.total
    }

    pub fn is_stale(&self, partition: PartitionId) -> bool {
        self.stale.contains(&partition)
    }
}

/// Compare snapshot times of one event type's partitions.
pub fn detect_stale<'a, I>(offsets: I, tolerance: Duration) -> StaleReport
where
    I: IntoIterator<Item = &'a PartitionOffset>,
{
    let offsets: Vec<&PartitionOffset> = offsets.into_iter().collect();
    let freshest = match offsets.iter().map(|o| o.snapshot_time).max() {
        Some(t) => t,
        None => return StaleReport::default(),
    };
    let tolerance_ms = tolerance.as_millis() as u64;
    let stale = offsets
        .iter()
        .filter(|o| freshest.millis_since(o.snapshot_time) > tolerance_ms)
        .map(|o| o.partition)
        .collect();
    StaleReport {
        stale,
        total: offsets.len(),
    }
}

/// Tally of per-event-type results at the join point.
#[derive(Clone, Debug, Default)]
pub struct JoinSummary {
    pub total: usize,
    /// Event types that produced a result (full or partial).
    pub resolved: usize,
    /// Event types that do not exist.
    pub permanent: Vec<String>,
    /// Event types that failed transiently or never finished.
    pub failed: Vec<String>,
    /// Resolved event types flagged inconsistent.
    pub inconsistent: Vec<String>,
    /// Resolved event types with any non-OK marker.
    pub degraded: usize,
}

/// Why a request must fail.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Succeeded(StatsOutcome),
    NotFound { event_type: String },
    Unavailable { reason: String },
    Inconsistent { event_types: Vec<String> },
}

impl FailurePolicy {
    /// Decide the terminal state of a request from its join summary.
    pub fn evaluate(&self, summary: &JoinSummary) -> Verdict {
        if self.fail_on_permanent {
            if let Some(event_type) = summary.permanent.first() {
                return Verdict::NotFound {
                    event_type: event_type.clone(),
                };
            }
        }

        if summary.total == 0 {
            return Verdict::Succeeded(StatsOutcome::Complete);
        }

        let total = summary.total as f64;

        if summary.resolved == 0 && summary.permanent.is_empty() {
            return Verdict::Unavailable {
                reason: format!("none of {} event types could be fetched", summary.total),
            };
        }

        let failed = summary.failed.len() + summary.permanent.len();
        if failed as f64 / total > self.max_failed_ratio {
            return Verdict::Unavailable {
                reason: format!(
                    "{} of {} event types failed ({})",
                    failed,
                    summary.total,
                    summary.failed.join(", ")
                ),
            };
        }

        if summary.inconsistent.len() as f64 / total > self.max_inconsistent_ratio {
            return Verdict::Inconsistent {
                event_types: summary.inconsistent.clone(),
            };
        }

        if failed == 0 && summary.degraded == 0 && summary.inconsistent.is_empty() {
            Verdict::Succeeded(StatsOutcome::Complete)
        } else {
            Verdict::Succeeded(StatsOutcome::Partial)
        }
    }
}

/// Lifecycle of one stats request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Init,
    Dispatched,
    Complete,
    Partial,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Complete | RequestState::Partial | RequestState::Failed
        )
    }

    fn can_move_to(self, next: RequestState) -> bool {
        match (self, next) {
            (RequestState::Init, RequestState::Dispatched) => true,
            // Validation failures and empty subscriptions end before dispatch.
            (RequestState::Init, RequestState::Failed | RequestState::Complete) => true,
            (RequestState::Dispatched, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Init => "INIT",
            RequestState::Dispatched => "DISPATCHED",
            RequestState::Complete => "COMPLETE",
            RequestState::Partial => "PARTIAL",
            RequestState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Tracks the state machine of a single request.
#[derive(Debug)]
pub struct RequestTracker {
    subscription: SubscriptionId,
    state: RequestState,
}

impl RequestTracker {
    pub fn new(subscription: SubscriptionId) -> Self {
        Self {
            subscription,
            state: RequestState::Init,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Move to `next`. Illegal transitions are ignored and logged.
    pub fn advance(&mut self, next: RequestState) -> bool {
        if !self.state.can_move_to(next) {
            tracing::warn!(
                subscription = %self.subscription,
                from = %self.state,
                to = %next,
                "ignoring illegal stats request transition"
            );
            return false;
        }
        tracing::debug!(
            subscription = %self.subscription,
            from = %self.state,
            to = %next,
            "stats request transition"
        );
        self.state = next;
        true
    }

    pub fn finish(&mut self, outcome: StatsOutcome) {
        self.advance(match outcome {
            StatsOutcome::Complete => RequestState::Complete,
            StatsOutcome::Partial => RequestState::Partial,
        });
    }
}
