//! LRU cache in front of a timestamp resolver.

use super::LagTimestampResolver;
use crate::error::SourceError;
use crate::types::{PartitionId, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

type CacheKey = (String, PartitionId, u64);

/// Remembers resolved message timestamps.
///
/// A message's timestamp at a given offset never changes, so entries are
/// never invalidated; only successful lookups are cached.
pub struct CachedTimestampResolver {
    inner: Arc<dyn LagTimestampResolver>,
    cache: Mutex<LruCache<CacheKey, Timestamp>>,
}

impl CachedTimestampResolver {
    pub fn new(inner: Arc<dyn LagTimestampResolver>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl LagTimestampResolver for CachedTimestampResolver {
    fn resolve_timestamp(
        &self,
        event_type: &str,
        partition: PartitionId,
        offset: u64,
    ) -> Result<Timestamp, SourceError> {
        let key = (event_type.to_string(), partition, offset);
        if let Some(hit) = self.cache.lock().get(&key).copied() {
            return Ok(hit);
        }

        // Not holding the lock across the slow lookup.
        let resolved = self.inner.resolve_timestamp(event_type, partition, offset)?;
        self.cache.lock().put(key, resolved);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryTimestampResolver;

    #[test]
    fn test_hits_skip_inner_resolver() {
        let inner = Arc::new(MemoryTimestampResolver::new());
        inner.set_timestamp("orders", 0, 7, Timestamp(500));
        let cached = CachedTimestampResolver::new(inner.clone(), 16);

        for _ in 0..3 {
            assert_eq!(
                cached.resolve_timestamp("orders", PartitionId(0), 7),
                Ok(Timestamp(500))
            );
        }
        assert_eq!(inner.calls(), 1);
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let inner = Arc::new(MemoryTimestampResolver::new());
        let cached = CachedTimestampResolver::new(inner.clone(), 16);

        assert!(cached.resolve_timestamp("orders", PartitionId(0), 7).is_err());
        inner.set_timestamp("orders", 0, 7, Timestamp(500));
        assert_eq!(
            cached.resolve_timestamp("orders", PartitionId(0), 7),
            Ok(Timestamp(500))
        );
        assert_eq!(inner.calls(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let inner = Arc::new(MemoryTimestampResolver::new());
        for offset in 0..3 {
            inner.set_timestamp("orders", 0, offset, Timestamp(offset as i64));
        }
        let cached = CachedTimestampResolver::new(inner.clone(), 2);

        for offset in 0..3 {
            cached
                .resolve_timestamp("orders", PartitionId(0), offset)
                .unwrap();
        }
        assert_eq!(cached.len(), 2);

        // Offset 0 was evicted.
        cached.resolve_timestamp("orders", PartitionId(0), 0).unwrap();
        assert_eq!(inner.calls(), 4);
    }
}
