//! Subscription lag statistics.
//!
//! A request resolves the subscription, then runs one task per event type:
//! fetch partition offsets, compute `newest - committed` per partition and,
//! in TIMELAG mode, how old the oldest unconsumed message is. Tasks share a
//! single deadline. Whatever has been collected when it expires is what the
//! response is built from.

mod aggregator;
mod collector;
mod listing;
mod task;

pub use aggregator::StatsAggregator;
pub use listing::{EventTypeStatus, ListingStatus, SubscriptionListing};
