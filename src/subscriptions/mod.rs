//! Subscription registry.
//!
//! A subscription binds an owning application and a consumer group to an
//! ordered set of event types. The registry provides:
//! - Idempotent creation keyed by application, consumer group and event types
//! - Lookup by identifier
//! - Filtered listing with stable `limit`/`offset` paging
//! - Two-step deletion: mark `Deleting`, then purge
//!
//! A registry is in-memory by default or durable when opened on a file.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new();
//! let (sub, created) = registry.create(SubscriptionInput::new("shop", &["orders"]))?;
//!
//! let page = registry.list(&ListQuery::default().owning_application("shop"))?;
//! registry.delete(&sub.id)?;
//! ```

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{
    ListQuery, Page, ReadFrom, Subscription, SubscriptionInput, SubscriptionStatus,
    DEFAULT_CONSUMER_GROUP, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};
