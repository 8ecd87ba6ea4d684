//! In-process offset source and timestamp resolver.

use super::{LagTimestampResolver, OffsetBatch, PartitionOffsetSource};
use crate::error::SourceError;
use crate::types::{PartitionId, PartitionOffset, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::thread;
use std::time::Duration;

/// Retained range of one partition.
#[derive(Clone, Copy, Debug)]
struct PartitionLog {
    earliest: u64,
    newest: u64,
    snapshot_time: Option<Timestamp>,
}

/// Injected misbehaviour for one fetch call.
#[derive(Clone, Debug)]
enum Fault {
    Unavailable,
    Unreachable(Vec<PartitionId>),
}

#[derive(Default)]
struct Faults {
    /// Consumed one per call, front first.
    queued: VecDeque<Fault>,
    /// Applied once the queue is empty.
    always: Option<Fault>,
    latency: Option<Duration>,
}

/// Offset source backed by in-memory partition logs and commits.
///
/// Faults and latency can be scripted per event type, and every call is
/// counted, which makes the engine's retry and cancellation behaviour
/// observable.
#[derive(Default)]
pub struct MemoryOffsetSource {
    logs: RwLock<HashMap<String, BTreeMap<PartitionId, PartitionLog>>>,
    /// (consumer group, event type, partition) -> committed offset.
    commits: RwLock<HashMap<(String, String, PartitionId), u64>>,
    faults: Mutex<HashMap<String, Faults>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemoryOffsetSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an event type with no partitions yet.
    pub fn add_event_type(&self, event_type: &str) {
        self.logs.write().entry(event_type.to_string()).or_default();
    }

    /// Set the retained range of a partition, creating it if needed.
    pub fn set_log(&self, event_type: &str, partition: u32, earliest: u64, newest: u64) {
        let mut logs = self.logs.write();
        let partitions = logs.entry(event_type.to_string()).or_default();
        let entry = partitions.entry(PartitionId(partition)).or_insert(PartitionLog {
            earliest,
            newest,
            snapshot_time: None,
        });
        entry.earliest = earliest;
        entry.newest = newest;
    }

    /// Record a consumer group's committed offset. Not validated.
    pub fn commit(&self, consumer_group: &str, event_type: &str, partition: u32, offset: u64) {
        self.commits.write().insert(
            (
                consumer_group.to_string(),
                event_type.to_string(),
                PartitionId(partition),
            ),
            offset,
        );
    }

    /// Shorthand for a partition starting at offset 0 with one commit.
    pub fn put(
        &self,
        consumer_group: &str,
        event_type: &str,
        partition: u32,
        committed: u64,
        newest: u64,
    ) {
        self.set_log(event_type, partition, 0, newest);
        self.commit(consumer_group, event_type, partition, committed);
    }

    /// Pin the snapshot time reported for a partition (default: now).
    pub fn set_snapshot_time(&self, event_type: &str, partition: u32, at: Timestamp) {
        if let Some(log) = self
            .logs
            .write()
            .get_mut(event_type)
            .and_then(|p| p.get_mut(&PartitionId(partition)))
        {
            log.snapshot_time = Some(at);
        }
    }

    pub fn remove_event_type(&self, event_type: &str) {
        self.logs.write().remove(event_type);
    }

    /// Fail the next `times` fetches of `event_type` with `Unavailable`.
    pub fn fail_next(&self, event_type: &str, times: usize) {
        let mut faults = self.faults.lock();
        let entry = faults.entry(event_type.to_string()).or_default();
        entry
            .queued
            .extend(std::iter::repeat(Fault::Unavailable).take(times));
    }

    /// Fail every fetch of `event_type` with `Unavailable`.
    pub fn fail_always(&self, event_type: &str) {
        self.faults
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .always = Some(Fault::Unavailable);
    }

    /// Report `partitions` unreachable on the next `times` fetches.
    pub fn unreachable_next(&self, event_type: &str, partitions: &[u32], times: usize) {
        let fault = Fault::Unreachable(partitions.iter().copied().map(PartitionId).collect());
        let mut faults = self.faults.lock();
        let entry = faults.entry(event_type.to_string()).or_default();
        entry.queued.extend(std::iter::repeat(fault).take(times));
    }

    /// Report `partitions` unreachable on every fetch.
    pub fn unreachable_always(&self, event_type: &str, partitions: &[u32]) {
        let fault = Fault::Unreachable(partitions.iter().copied().map(PartitionId).collect());
        self.faults
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .always = Some(fault);
    }

    /// Delay every fetch of `event_type` by `latency`.
    pub fn set_latency(&self, event_type: &str, latency: Duration) {
        self.faults
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .latency = Some(latency);
    }

    /// Drop all scripted faults and latency.
    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    /// Fetches made for `event_type`.
    pub fn calls(&self, event_type: &str) -> usize {
        self.calls.lock().get(event_type).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    fn next_fault(&self, event_type: &str) -> (Option<Fault>, Option<Duration>) {
        let mut faults = self.faults.lock();
        match faults.get_mut(event_type) {
            Some(f) => {
                let fault = f.queued.pop_front().or_else(|| f.always.clone());
                (fault, f.latency)
            }
            None => (None, None),
        }
    }
}

impl PartitionOffsetSource for MemoryOffsetSource {
    fn fetch(&self, consumer_group: &str, event_type: &str) -> Result<OffsetBatch, SourceError> {
        *self.calls.lock().entry(event_type.to_string()).or_insert(0) += 1;

        let (fault, latency) = self.next_fault(event_type);
        if let Some(latency) = latency {
            thread::sleep(latency);
        }

        let unreachable: HashSet<PartitionId> = match fault {
            Some(Fault::Unavailable) => {
                return Err(SourceError::Unavailable(format!(
                    "offsets of {} unavailable",
                    event_type
                )))
            }
            Some(Fault::Unreachable(partitions)) => partitions.into_iter().collect(),
            None => HashSet::new(),
        };

        let logs = self.logs.read();
        let partitions = logs
            .get(event_type)
            .ok_or_else(|| SourceError::NotFound(event_type.to_string()))?;
        let commits = self.commits.read();
        let now = Timestamp::now();

        let mut batch = OffsetBatch::default();
        for (partition, log) in partitions {
            if unreachable.contains(partition) {
                batch.unreachable.push(*partition);
                continue;
            }
            let committed = commits
                .get(&(
                    consumer_group.to_string(),
                    event_type.to_string(),
                    *partition,
                ))
                .copied()
                .unwrap_or(log.earliest);
            batch.offsets.push(PartitionOffset {
                event_type: event_type.to_string(),
                partition: *partition,
                committed,
                earliest: log.earliest,
                newest: log.newest,
                snapshot_time: log.snapshot_time.unwrap_or(now),
            });
        }
        Ok(batch)
    }
}

/// Timestamp resolver backed by a table of known message times.
///
/// Offsets without an entry resolve as `Unavailable`.
#[derive(Default)]
pub struct MemoryTimestampResolver {
    timestamps: RwLock<HashMap<(String, PartitionId, u64), Timestamp>>,
    failing: RwLock<HashSet<(String, PartitionId)>>,
    latency: RwLock<Option<Duration>>,
    calls: Mutex<usize>,
}

impl MemoryTimestampResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_timestamp(&self, event_type: &str, partition: u32, offset: u64, at: Timestamp) {
        self.timestamps
            .write()
            .insert((event_type.to_string(), PartitionId(partition), offset), at);
    }

    /// Make every lookup on a partition fail with `Unavailable`.
    pub fn fail_partition(&self, event_type: &str, partition: u32) {
        self.failing
            .write()
            .insert((event_type.to_string(), PartitionId(partition)));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = Some(latency);
    }

    /// Lookups made so far.
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl LagTimestampResolver for MemoryTimestampResolver {
    fn resolve_timestamp(
        &self,
        event_type: &str,
        partition: PartitionId,
        offset: u64,
    ) -> Result<Timestamp, SourceError> {
        *self.calls.lock() += 1;

        if let Some(latency) = *self.latency.read() {
            thread::sleep(latency);
        }

        if self
            .failing
            .read()
            .contains(&(event_type.to_string(), partition))
        {
            return Err(SourceError::Unavailable(format!(
                "timestamps of {}/{} unavailable",
                event_type, partition
            )));
        }

        self.timestamps
            .read()
            .get(&(event_type.to_string(), partition, offset))
            .copied()
            .ok_or_else(|| {
                SourceError::Unavailable(format!(
                    "no message at {}/{}@{}",
                    event_type, partition, offset
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_reads_commits_per_group() {
        let source = MemoryOffsetSource::new();
        source.put("g1", "orders", 0, 10, 15);
        source.put("g1", "orders", 1, 5, 5);
        source.commit("g2", "orders", 0, 3);

        let batch = source.fetch("g1", "orders").unwrap();
        assert!(batch.unreachable.is_empty());
        assert_eq!(batch.offsets.len(), 2);
        assert_eq!(batch.offsets[0].partition, PartitionId(0));
        assert_eq!(batch.offsets[0].committed, 10);
        assert_eq!(batch.offsets[0].newest, 15);
        assert_eq!(batch.offsets[1].committed, 5);

        let batch = source.fetch("g2", "orders").unwrap();
        assert_eq!(batch.offsets[0].committed, 3);
        // No commit: starts at earliest.
        assert_eq!(batch.offsets[1].committed, 0);
    }

    #[test]
    fn test_unknown_event_type_is_not_found() {
        let source = MemoryOffsetSource::new();
        assert_eq!(
            source.fetch("g", "missing"),
            Err(SourceError::NotFound("missing".to_string()))
        );
        assert_eq!(source.calls("missing"), 1);
    }

    #[test]
    fn test_scripted_faults_are_consumed_in_order() {
        let source = MemoryOffsetSource::new();
        source.put("g", "orders", 0, 1, 2);
        source.put("g", "orders", 1, 1, 2);
        source.fail_next("orders", 1);
        source.unreachable_next("orders", &[1], 1);

        assert!(matches!(
            source.fetch("g", "orders"),
            Err(SourceError::Unavailable(_))
        ));
        let batch = source.fetch("g", "orders").unwrap();
        assert_eq!(batch.unreachable, vec![PartitionId(1)]);
        assert_eq!(batch.offsets.len(), 1);
        let batch = source.fetch("g", "orders").unwrap();
        assert_eq!(batch.offsets.len(), 2);
        assert_eq!(source.calls("orders"), 3);
    }

    #[test]
    fn test_fail_always_until_healed() {
        let source = MemoryOffsetSource::new();
        source.put("g", "orders", 0, 1, 2);
        source.fail_always("orders");
        assert!(source.fetch("g", "orders").is_err());
        assert!(source.fetch("g", "orders").is_err());
        source.heal();
        assert!(source.fetch("g", "orders").is_ok());
    }

    #[test]
    fn test_resolver_lookup_and_failures() {
        let resolver = MemoryTimestampResolver::new();
        resolver.set_timestamp("orders", 0, 10, Timestamp(1_000));

        assert_eq!(
            resolver.resolve_timestamp("orders", PartitionId(0), 10),
            Ok(Timestamp(1_000))
        );
        assert!(resolver
            .resolve_timestamp("orders", PartitionId(0), 11)
            .is_err());

        resolver.fail_partition("orders", 0);
        assert!(resolver
            .resolve_timestamp("orders", PartitionId(0), 10)
            .is_err());
        assert_eq!(resolver.calls(), 3);
    }
}
