//! Collaborator contracts for offset and timestamp lookups.
//!
//! The stats engine never talks to brokers directly. It is handed
//! implementations of two traits:
//! - [`PartitionOffsetSource`]: committed/earliest/newest offsets per partition
//! - [`LagTimestampResolver`]: the wall-clock time of a message at an offset
//!
//! [`MemoryOffsetSource`] and [`MemoryTimestampResolver`] are in-process
//! implementations with scriptable faults, and [`CachedTimestampResolver`]
//! puts an LRU in front of any resolver.

mod cache;
mod memory;

pub use cache::CachedTimestampResolver;
pub use memory::{MemoryOffsetSource, MemoryTimestampResolver};

use crate::error::SourceError;
use crate::types::{PartitionId, PartitionOffset, Timestamp};

/// One reading of an event type's partitions.
///
/// Partitions the source could not reach are listed in `unreachable`
/// instead of failing the whole call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetBatch {
    pub offsets: Vec<PartitionOffset>,
    pub unreachable: Vec<PartitionId>,
}

impl OffsetBatch {
    pub fn complete(offsets: Vec<PartitionOffset>) -> Self {
        Self {
            offsets,
            unreachable: Vec::new(),
        }
    }
}

/// Per-partition offsets of an event type.
pub trait PartitionOffsetSource: Send + Sync {
    /// Read every partition of `event_type`, with committed offsets taken
    /// from `consumer_group`.
    ///
    /// Fails with `Unavailable` on transient trouble and `NotFound` when the
    /// event type does not exist.
    fn fetch(&self, consumer_group: &str, event_type: &str) -> Result<OffsetBatch, SourceError>;
}

/// Resolves message timestamps for time-lag computation.
pub trait LagTimestampResolver: Send + Sync {
    fn resolve_timestamp(
        &self,
        event_type: &str,
        partition: PartitionId,
        offset: u64,
    ) -> Result<Timestamp, SourceError>;
}
