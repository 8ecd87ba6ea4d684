//! # Subscription Stats
//!
//! Per-partition consumption lag for event-stream subscriptions, computed
//! from unreliable offset and timestamp lookups.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: A consumer group reading a set of event types
//! - **Offsets**: Committed, earliest and newest positions per partition
//! - **Stats**: Unconsumed counts and optional time lag, fanned out per event type
//! - **Governor**: Retries, deadlines and thresholds that pick `COMPLETE`,
//!   `PARTIAL` or a typed failure
//!
//! ## Example
//!
//! ```ignore
//! use substats::{
//!     MemoryOffsetSource, MemoryTimestampResolver, StatsAggregator, StatsConfig, StatsMode,
//!     SubscriptionInput, SubscriptionRegistry,
//! };
//! use std::sync::Arc;
//!
//! let registry = Arc::new(SubscriptionRegistry::new());
//! let (sub, _) = registry.create(SubscriptionInput::new("shop", &["orders"]))?;
//!
//! let source = Arc::new(MemoryOffsetSource::new());
//! source.put("default", "orders", 0, 10, 15);
//!
//! let stats = StatsAggregator::new(
//!     registry,
//!     source,
//!     Arc::new(MemoryTimestampResolver::new()),
//!     StatsConfig::default(),
//! )?;
//! let response = stats.compute_stats(&sub.id, StatsMode::Normal)?;
//! println!("{}", response.to_json());
//! ```

pub mod config;
pub mod error;
pub mod governor;
pub mod source;
pub mod stats;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::StatsConfig;
pub use error::{ErrorKind, Result, SourceError, SubscriptionError};
pub use governor::{
    AvailabilityGovernor, CancellationToken, Deadline, FailureClass, FailurePolicy,
    RequestState, RetryPolicy,
};
pub use source::{
    CachedTimestampResolver, LagTimestampResolver, MemoryOffsetSource, MemoryTimestampResolver,
    OffsetBatch, PartitionOffsetSource,
};
pub use stats::{EventTypeStatus, ListingStatus, StatsAggregator, SubscriptionListing};
pub use subscriptions::{
    ListQuery, Page, ReadFrom, Subscription, SubscriptionInput, SubscriptionRegistry,
    SubscriptionStatus, DEFAULT_CONSUMER_GROUP, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};
pub use types::{
    Clock, EventTypeState, FixedClock, PartitionId, PartitionOffset, PartitionStat,
    PartitionState, StatsMode, StatsOutcome, StatsResponse, SubscriptionEventTypeStats,
    SubscriptionId, SystemClock, Timestamp,
};
