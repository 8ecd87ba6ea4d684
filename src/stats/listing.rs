//! Subscription listings annotated with stats-derived status.

use crate::subscriptions::Subscription;
use crate::types::{EventTypeState, StatsOutcome, StatsResponse};
use serde::{Deserialize, Serialize};

/// Health of one event type of a listed subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeStatus {
    pub event_type: String,
    pub state: EventTypeState,
    /// Sum over partitions with a known count.
    pub unconsumed: u64,
}

/// Status attached to a listing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingStatus {
    /// `None` when stats could not be computed; every event type is then
    /// `Degraded`.
    pub outcome: Option<StatsOutcome>,
    pub event_types: Vec<EventTypeStatus>,
}

impl ListingStatus {
    pub(crate) fn from_response(response: &StatsResponse) -> Self {
        Self {
            outcome: Some(response.outcome),
            event_types: response
                .items
                .iter()
                .map(|item| EventTypeStatus {
                    event_type: item.event_type.clone(),
                    state: item.state,
                    unconsumed: item.total_unconsumed(),
                })
                .collect(),
        }
    }

    pub(crate) fn unavailable(subscription: &Subscription) -> Self {
        Self {
            outcome: None,
            event_types: subscription
                .event_types
                .iter()
                .map(|event_type| EventTypeStatus {
                    event_type: event_type.clone(),
                    state: EventTypeState::Degraded,
                    unconsumed: 0,
                })
                .collect(),
        }
    }
}

/// One entry of a subscription listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionListing {
    #[serde(flatten)]
    pub subscription: Subscription,
    /// Present only when the listing asked for status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ListingStatus>,
}
