//! Core types for subscription stats.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque subscription identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        SubscriptionId(s.to_string())
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        SubscriptionId(s)
    }
}

/// Numeric partition identifier within an event type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Partition({})", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        // A clock set before 1970 reads as the epoch.
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    /// Milliseconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0).max(0) as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Source of "now" for time-lag computation.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock frozen at one instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}

/// Offsets of one partition as observed by the offset source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub event_type: String,
    pub partition: PartitionId,
    /// Last offset committed by the subscription's consumer group.
    pub committed: u64,
    /// Oldest offset still retained.
    pub earliest: u64,
    /// Latest offset written.
    pub newest: u64,
    /// When the source took this reading.
    pub snapshot_time: Timestamp,
}

impl PartitionOffset {
    /// Whether `earliest <= committed <= newest` holds.
    pub fn is_well_formed(&self) -> bool {
        self.earliest <= self.committed && self.committed <= self.newest
    }

    /// Messages not yet consumed, or `None` if the offsets are malformed.
    pub fn unconsumed(&self) -> Option<u64> {
        if self.is_well_formed() {
            Some(self.newest - self.committed)
        } else {
            None
        }
    }
}

/// Per-partition health marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Ok,
    /// Count is valid but something else (time lag, freshness) is not.
    Degraded,
    /// Nothing trustworthy is known about the partition.
    Unknown,
}

/// Per-event-type health marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTypeState {
    Ok,
    Degraded,
}

/// Lag of one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStat {
    pub partition: PartitionId,
    /// Zero and meaningless when `state` is `Unknown`.
    pub unconsumed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_lag_ms: Option<u64>,
    pub state: PartitionState,
}

impl PartitionStat {
    pub fn unknown(partition: PartitionId) -> Self {
        Self {
            partition,
            unconsumed: 0,
            time_lag_ms: None,
            state: PartitionState::Unknown,
        }
    }
}

/// Point-in-time lag of one event type of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEventTypeStats {
    pub event_type: String,
    pub state: EventTypeState,
    /// Set when most partition snapshots disagreed in freshness.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inconsistent: bool,
    /// Ascending by partition id.
    pub partitions: Vec<PartitionStat>,
}

impl SubscriptionEventTypeStats {
    /// Whether every partition is `Ok` and the event type itself is `Ok`.
    pub fn is_healthy(&self) -> bool {
        self.state == EventTypeState::Ok
            && !self.inconsistent
            && self.partitions.iter().all(|p| p.state == PartitionState::Ok)
    }

    /// Total unconsumed messages over partitions with a known count.
    pub fn total_unconsumed(&self) -> u64 {
        self.partitions
            .iter()
            .filter(|p| p.state != PartitionState::Unknown)
            .map(|p| p.unconsumed)
            .sum()
    }
}

/// How much work a stats request does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsMode {
    /// Unconsumed counts only.
    Normal,
    /// Counts plus time lag per partition.
    TimeLag,
}

impl StatsMode {
    /// Map the "include time lag" request flag to a mode.
    pub fn from_time_lag_flag(show_time_lag: bool) -> Self {
        if show_time_lag {
            StatsMode::TimeLag
        } else {
            StatsMode::Normal
        }
    }

    pub fn wants_time_lag(self) -> bool {
        self == StatsMode::TimeLag
    }
}

/// Successful terminal state of a stats request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsOutcome {
    /// Every event type resolved without degradation.
    Complete,
    /// Some entries are degraded but within the failure threshold.
    Partial,
}

/// Result of one stats request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub subscription_id: SubscriptionId,
    pub mode: StatsMode,
    pub outcome: StatsOutcome,
    /// In subscription event-type order.
    pub items: Vec<SubscriptionEventTypeStats>,
}

impl StatsResponse {
    pub fn is_complete(&self) -> bool {
        self.outcome == StatsOutcome::Complete
    }

    pub fn item(&self, event_type: &str) -> Option<&SubscriptionEventTypeStats> {
        self.items.iter().find(|i| i.event_type == event_type)
    }

    /// Serialize as the `{"items": [...]}` envelope with the outcome marker.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "outcome": self.outcome,
            "items": self.items,
        })
    }
}
