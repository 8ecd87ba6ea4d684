//! Subscription descriptor types.

use crate::types::{SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Largest page size a listing accepts.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Consumer group used when a subscription does not name one.
pub const DEFAULT_CONSUMER_GROUP: &str = "default";

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    /// Deleted; waiting to be purged.
    Deleting,
}

/// Where a new consumer group starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    Begin,
    #[default]
    End,
    /// Explicit initial cursors supplied by the client.
    Cursors,
}

/// A durable consumption contract over one or more event types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owning_application: String,
    /// Unique, in creation order.
    pub event_types: Vec<String>,
    pub consumer_group: String,
    pub read_from: ReadFrom,
    pub status: SubscriptionStatus,
    pub created_at: Timestamp,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Idempotency key: creating a subscription with the same key returns
    /// the existing one.
    pub(crate) fn key(&self) -> String {
        subscription_key(
            &self.owning_application,
            &self.consumer_group,
            &self.event_types,
        )
    }
}

pub(crate) fn subscription_key(
    owning_application: &str,
    consumer_group: &str,
    event_types: &[String],
) -> String {
    let sorted: BTreeSet<&str> = event_types.iter().map(String::as_str).collect();
    let types: Vec<&str> = sorted.into_iter().collect();
    format!(
        "{}\u{1f}{}\u{1f}{}",
        owning_application,
        consumer_group,
        types.join("\u{1e}")
    )
}

/// Input for creating a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInput {
    pub owning_application: String,
    pub event_types: Vec<String>,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default)]
    pub read_from: ReadFrom,
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

impl SubscriptionInput {
    pub fn new(owning_application: impl Into<String>, event_types: &[&str]) -> Self {
        Self {
            owning_application: owning_application.into(),
            event_types: event_types.iter().map(|s| s.to_string()).collect(),
            consumer_group: default_consumer_group(),
            read_from: ReadFrom::default(),
        }
    }

    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = read_from;
        self
    }
}

/// Filter and paging for listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListQuery {
    /// Only subscriptions of this application.
    pub owning_application: Option<String>,
    /// Only subscriptions consuming all of these event types.
    pub event_types: Option<BTreeSet<String>>,
    pub limit: usize,
    pub offset: usize,
    /// Attach stats-derived status to each entry. Only honored by
    /// `StatsAggregator::list_subscriptions`; the registry ignores it.
    pub show_status: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            owning_application: None,
            event_types: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            show_status: false,
        }
    }
}

impl ListQuery {
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }

    pub fn owning_application(mut self, app: impl Into<String>) -> Self {
        self.owning_application = Some(app.into());
        self
    }

    pub fn event_types(mut self, event_types: &[&str]) -> Self {
        self.event_types = Some(event_types.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn show_status(mut self, show: bool) -> Self {
        self.show_status = show;
        self
    }

    pub(crate) fn matches(&self, subscription: &Subscription) -> bool {
        if let Some(ref app) = self.owning_application {
            if &subscription.owning_application != app {
                return false;
            }
        }
        if let Some(ref wanted) = self.event_types {
            if !wanted
                .iter()
                .all(|et| subscription.event_types.iter().any(|s| s == et))
            {
                return false;
            }
        }
        true
    }
}

/// One page of a listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub limit: usize,
    pub offset: usize,
    /// Offset of the previous page, if any.
    pub prev_offset: Option<usize>,
    /// Offset of the next page, if more items exist.
    pub next_offset: Option<usize>,
}
