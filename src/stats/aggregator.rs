//! Stats aggregator: fan out per event type, join under a deadline.

use super::collector::{ResultCollector, TaskOutcome};
use super::listing::{ListingStatus, SubscriptionListing};
use super::task::{self, TaskContext, TaskResult};
use crate::config::StatsConfig;
use crate::error::{Result, SubscriptionError};
use crate::governor::{AvailabilityGovernor, FailureClass, JoinSummary, RequestState, RequestTracker};
use crate::source::{CachedTimestampResolver, LagTimestampResolver, PartitionOffsetSource};
use crate::subscriptions::{ListQuery, Page, SubscriptionRegistry};
use crate::types::{
    Clock, EventTypeState, PartitionId, PartitionStat, StatsMode, StatsResponse,
    SubscriptionEventTypeStats, SubscriptionId, SystemClock,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Sent by a worker once its result is in the collector.
struct Completion {
    event_type: String,
    permanent: bool,
}

/// Counts a live worker thread until dropped.
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Last partition layout seen per event type, bounded by LRU eviction.
///
/// Lets a failed event type still list its partitions as `Unknown`.
struct PartitionTopology {
    known: Option<Mutex<LruCache<String, Vec<PartitionId>>>>,
}

impl PartitionTopology {
    fn new(capacity: usize) -> Self {
        Self {
            known: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
        }
    }

    fn remember(&self, stats: &SubscriptionEventTypeStats) {
        if let Some(known) = &self.known {
            let partitions = stats.partitions.iter().map(|p| p.partition).collect();
            known.lock().put(stats.event_type.clone(), partitions);
        }
    }

    fn unknown_entry(&self, event_type: &str) -> SubscriptionEventTypeStats {
        let partitions = self
            .known
            .as_ref()
            .and_then(|known| {
                known
                    .lock()
                    .get(event_type)
                    .map(|ids| ids.iter().copied().map(PartitionStat::unknown).collect())
            })
            .unwrap_or_default();
        SubscriptionEventTypeStats {
            event_type: event_type.to_string(),
            state: EventTypeState::Degraded,
            inconsistent: false,
            partitions,
        }
    }
}

/// Computes per-partition lag for subscriptions.
///
/// Each request fans out one task per event type onto a bounded set of
/// worker threads and joins them under a single deadline. Late or failed
/// event types degrade the response instead of blocking it, until the
/// governor's thresholds say the whole request must fail.
pub struct StatsAggregator {
    registry: Arc<SubscriptionRegistry>,
    source: Arc<dyn PartitionOffsetSource>,
    resolver: Arc<dyn LagTimestampResolver>,
    clock: Arc<dyn Clock>,
    governor: AvailabilityGovernor,
    config: StatsConfig,
    topology: PartitionTopology,
    active_workers: Arc<AtomicUsize>,
}

impl StatsAggregator {
    /// Build an aggregator over the given collaborators.
    ///
    /// The resolver is wrapped in an LRU cache unless
    /// `config.timestamp_cache_size` is 0.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        source: Arc<dyn PartitionOffsetSource>,
        resolver: Arc<dyn LagTimestampResolver>,
        config: StatsConfig,
    ) -> Result<Self> {
        config.validate()?;

        let resolver: Arc<dyn LagTimestampResolver> = if config.timestamp_cache_size > 0 {
            Arc::new(CachedTimestampResolver::new(
                resolver,
                config.timestamp_cache_size,
            ))
        } else {
            resolver
        };

        Ok(Self {
            registry,
            source,
            resolver,
            clock: Arc::new(SystemClock),
            governor: AvailabilityGovernor::new(&config),
            topology: PartitionTopology::new(config.topology_cache_size),
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replace the clock used for time lag.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Worker threads still running, including those of finished requests
    /// that are winding down after cancellation.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Compute the lag of every event type of a subscription.
    ///
    /// Fails with `SubscriptionNotFound` for unknown or deleting
    /// subscriptions; otherwise returns `COMPLETE`, `PARTIAL`, or the typed
    /// failure chosen by the governor.
    pub fn compute_stats(&self, id: &SubscriptionId, mode: StatsMode) -> Result<StatsResponse> {
        let span = tracing::info_span!("compute_stats", subscription = %id, ?mode);
        let _enter = span.enter();

        let mut tracker = RequestTracker::new(id.clone());

        let subscription = match self.registry.get(id) {
            Ok(s) if s.is_active() => s,
            Ok(_) => {
                tracker.advance(RequestState::Failed);
                tracing::debug!("subscription is being deleted");
                return Err(SubscriptionError::SubscriptionNotFound(id.clone()));
            }
            Err(e) => {
                tracker.advance(RequestState::Failed);
                return Err(e);
            }
        };

        let event_types = subscription.event_types;
        if event_types.is_empty() {
            tracker.advance(RequestState::Complete);
            return Ok(StatsResponse {
                subscription_id: id.clone(),
                mode,
                outcome: crate::types::StatsOutcome::Complete,
                items: Vec::new(),
            });
        }

        let (token, deadline) = self.governor.begin();
        let ctx = Arc::new(TaskContext {
            source: Arc::clone(&self.source),
            resolver: Arc::clone(&self.resolver),
            governor: self.governor.clone(),
            clock: Arc::clone(&self.clock),
            consumer_group: subscription.consumer_group,
            mode,
            timelag_concurrency: self.config.timelag_concurrency,
            token: token.clone(),
        });
        let collector = Arc::new(ResultCollector::new());

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        for event_type in &event_types {
            let _ = job_tx.send(event_type.clone());
        }
        drop(job_tx);

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let workers = self.config.worker_count(event_types.len());
        if let Err(e) = self.spawn_workers(workers, &job_rx, &ctx, &collector, &done_tx) {
            tracker.advance(RequestState::Failed);
            token.cancel();
            return Err(e);
        }
        drop(done_tx);
        tracker.advance(RequestState::Dispatched);
        tracing::debug!(event_types = event_types.len(), workers, "dispatched stats tasks");

        self.join(&done_rx, event_types.len(), deadline.instant());

        // Stops stragglers and freezes what they reported.
        token.cancel();
        let mut results = collector.seal();

        let mut summary = JoinSummary {
            total: event_types.len(),
            ..Default::default()
        };
        let mut items = Vec::with_capacity(event_types.len());
        for event_type in &event_types {
            match results.remove(event_type) {
                Some(TaskOutcome::Resolved(stats)) => {
                    self.topology.remember(&stats);
                    summary.resolved += 1;
                    if stats.inconsistent {
                        summary.inconsistent.push(event_type.clone());
                    }
                    if !stats.is_healthy() {
                        summary.degraded += 1;
                    }
                    items.push(stats);
                }
                Some(TaskOutcome::Failed { class, reason }) => {
                    tracing::warn!(%event_type, ?class, %reason, "event type failed");
                    match class {
                        FailureClass::Permanent => summary.permanent.push(event_type.clone()),
                        FailureClass::Transient | FailureClass::StaleSnapshot => {
                            summary.failed.push(event_type.clone())
                        }
                    }
                    items.push(self.topology.unknown_entry(event_type));
                }
                None => {
                    tracing::warn!(%event_type, "event type did not finish before the deadline");
                    summary.failed.push(event_type.clone());
                    items.push(self.topology.unknown_entry(event_type));
                }
            }
        }

        match self.governor.verdict(id, &summary) {
            Ok(outcome) => {
                tracker.finish(outcome);
                if tracker.state() == RequestState::Partial {
                    tracing::warn!(
                        failed = summary.failed.len() + summary.permanent.len(),
                        degraded = summary.degraded,
                        "returning partial stats"
                    );
                }
                Ok(StatsResponse {
                    subscription_id: id.clone(),
                    mode,
                    outcome,
                    items,
                })
            }
            Err(e) => {
                tracker.advance(RequestState::Failed);
                tracing::warn!(error = %e, "stats request failed");
                Err(e)
            }
        }
    }

    /// List subscriptions; with `query.show_status`, attach each one's
    /// current NORMAL-mode stats.
    ///
    /// A subscription whose stats fail is still listed, with every event
    /// type `Degraded` and no outcome.
    pub fn list_subscriptions(&self, query: &ListQuery) -> Result<Page<SubscriptionListing>> {
        let page = self.registry.list(query)?;

        let items = page
            .items
            .into_iter()
            .map(|subscription| {
                let stats = query.show_status.then(|| {
                    match self.compute_stats(&subscription.id, StatsMode::Normal) {
                        Ok(response) => ListingStatus::from_response(&response),
                        Err(e) => {
                            tracing::warn!(
                                subscription = %subscription.id,
                                error = %e,
                                "status unavailable for listing"
                            );
                            ListingStatus::unavailable(&subscription)
                        }
                    }
                });
                SubscriptionListing {
                    subscription,
                    stats,
                }
            })
            .collect();

        Ok(Page {
            items,
            limit: page.limit,
            offset: page.offset,
            prev_offset: page.prev_offset,
            next_offset: page.next_offset,
        })
    }

    /// Start `count` detached workers pulling event types from `jobs`.
    ///
    /// Fails only if not a single worker could be started.
    fn spawn_workers(
        &self,
        count: usize,
        jobs: &Receiver<String>,
        ctx: &Arc<TaskContext>,
        collector: &Arc<ResultCollector>,
        done: &Sender<Completion>,
    ) -> Result<()> {
        let parent = tracing::Span::current();
        let mut started = 0;

        for i in 0..count {
            let guard = WorkerGuard::new(&self.active_workers);
            let jobs = jobs.clone();
            let ctx = Arc::clone(ctx);
            let collector = Arc::clone(collector);
            let done = done.clone();
            let parent = parent.clone();

            let spawned = thread::Builder::new()
                .name(format!("substats-worker-{}", i))
                .spawn(move || {
                    let _guard = guard;
                    run_worker(&parent, &jobs, &ctx, &collector, &done);
                });

            match spawned {
                Ok(_) => started += 1,
                Err(e) if started > 0 => {
                    tracing::warn!(error = %e, started, "continuing with fewer workers");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Wait for completions until all arrive, the deadline passes, or a
    /// permanent failure makes the outcome certain.
    fn join(&self, done: &Receiver<Completion>, expected: usize, deadline: std::time::Instant) {
        let fail_fast = self.governor.failure_policy().fail_on_permanent;
        let mut completed = 0;

        while completed < expected {
            match done.recv_deadline(deadline) {
                Ok(completion) => {
                    completed += 1;
                    if completion.permanent && fail_fast {
                        tracing::debug!(
                            event_type = %completion.event_type,
                            "permanent failure; cancelling remaining tasks"
                        );
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        completed,
                        expected,
                        "stats deadline expired; cancelling outstanding tasks"
                    );
                    return;
                }
                // Every worker exited.
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

fn run_worker(
    parent: &tracing::Span,
    jobs: &Receiver<String>,
    ctx: &TaskContext,
    collector: &ResultCollector,
    done: &Sender<Completion>,
) {
    while let Ok(event_type) = jobs.recv() {
        if ctx.token.is_cancelled() {
            return;
        }

        let span = tracing::debug_span!(parent: parent, "stats_task", event_type = %event_type);
        let _enter = span.enter();

        match task::run(ctx, &event_type) {
            TaskResult::Cancelled => {
                tracing::debug!("task cancelled");
                return;
            }
            TaskResult::Done(outcome) => {
                let permanent = outcome.is_permanent();
                if !collector.insert(&event_type, outcome) {
                    // Sealed: the request is already answered.
                    return;
                }
                let _ = done.send(Completion {
                    event_type,
                    permanent,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryOffsetSource, MemoryTimestampResolver};
    use crate::subscriptions::SubscriptionInput;
    use crate::types::{FixedClock, PartitionState, StatsOutcome, Timestamp};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        source: Arc<MemoryOffsetSource>,
        resolver: Arc<MemoryTimestampResolver>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(SubscriptionRegistry::new()),
                source: Arc::new(MemoryOffsetSource::new()),
                resolver: Arc::new(MemoryTimestampResolver::new()),
            }
        }

        fn subscribe(&self, id: &str, event_types: &[&str]) -> SubscriptionId {
            self.registry
                .create_with_id(id.into(), SubscriptionInput::new("app", event_types))
                .unwrap()
                .0
                .id
        }

        fn aggregator(&self, config: StatsConfig) -> StatsAggregator {
            StatsAggregator::new(
                self.registry.clone(),
                self.source.clone(),
                self.resolver.clone(),
                config,
            )
            .unwrap()
        }
    }

    fn fast_config() -> StatsConfig {
        StatsConfig {
            retry: crate::governor::RetryPolicy::fixed(3, Duration::from_millis(1)),
            ..StatsConfig::default()
        }
    }

    #[test]
    fn test_normal_mode_example() {
        let fx = Fixture::new();
        let id = fx.subscribe("S1", &["orders"]);
        fx.source.put("default", "orders", 0, 10, 15);
        fx.source.put("default", "orders", 1, 5, 5);

        let response = fx
            .aggregator(fast_config())
            .compute_stats(&id, StatsMode::Normal)
            .unwrap();

        assert_eq!(response.outcome, StatsOutcome::Complete);
        let orders = response.item("orders").unwrap();
        assert_eq!(orders.state, EventTypeState::Ok);
        assert_eq!(
            orders.partitions,
            vec![
                PartitionStat {
                    partition: PartitionId(0),
                    unconsumed: 5,
                    time_lag_ms: None,
                    state: PartitionState::Ok,
                },
                PartitionStat {
                    partition: PartitionId(1),
                    unconsumed: 0,
                    time_lag_ms: None,
                    state: PartitionState::Ok,
                },
            ]
        );
    }

    #[test]
    fn test_time_lag_uses_clock() {
        let fx = Fixture::new();
        let id = fx.subscribe("S1", &["orders"]);
        fx.source.put("default", "orders", 0, 10, 15);
        fx.source.put("default", "orders", 1, 5, 5);
        fx.resolver
            .set_timestamp("orders", 0, 10, Timestamp(1_000_000));

        let aggregator = fx
            .aggregator(fast_config())
            .with_clock(Arc::new(FixedClock(Timestamp(1_004_500))));
        let response = aggregator.compute_stats(&id, StatsMode::TimeLag).unwrap();

        let orders = response.item("orders").unwrap();
        assert_eq!(orders.partitions[0].time_lag_ms, Some(4_500));
        assert_eq!(orders.partitions[1].time_lag_ms, Some(0));
        assert_eq!(fx.resolver.calls(), 1);
    }

    #[test]
    fn test_failed_event_type_lists_known_partitions() {
        let fx = Fixture::new();
        let id = fx.subscribe("S1", &["orders", "payments", "invoices"]);
        for et in ["orders", "payments", "invoices"] {
            fx.source.put("default", et, 0, 1, 2);
            fx.source.put("default", et, 1, 1, 2);
        }
        let aggregator = fx.aggregator(fast_config());

        // First request teaches the aggregator the partition layout.
        aggregator.compute_stats(&id, StatsMode::Normal).unwrap();

        fx.source.fail_always("payments");
        let response = aggregator.compute_stats(&id, StatsMode::Normal).unwrap();
        assert_eq!(response.outcome, StatsOutcome::Partial);

        let payments = response.item("payments").unwrap();
        assert_eq!(payments.state, EventTypeState::Degraded);
        assert_eq!(payments.partitions.len(), 2);
        assert!(payments
            .partitions
            .iter()
            .all(|p| p.state == PartitionState::Unknown));
    }

    fn layout(event_type: &str, partitions: u32) -> SubscriptionEventTypeStats {
        SubscriptionEventTypeStats {
            event_type: event_type.to_string(),
            state: EventTypeState::Ok,
            inconsistent: false,
            partitions: (0..partitions)
                .map(|p| PartitionStat {
                    partition: PartitionId(p),
                    unconsumed: 0,
                    time_lag_ms: None,
                    state: PartitionState::Ok,
                })
                .collect(),
        }
    }

    #[test]
    fn test_topology_evicts_least_recent_layout() {
        let topology = PartitionTopology::new(1);
        topology.remember(&layout("orders", 2));
        topology.remember(&layout("payments", 3));

        assert!(topology.unknown_entry("orders").partitions.is_empty());
        let payments = topology.unknown_entry("payments");
        assert_eq!(payments.partitions.len(), 3);
        assert!(payments
            .partitions
            .iter()
            .all(|p| p.state == PartitionState::Unknown));

        let disabled = PartitionTopology::new(0);
        disabled.remember(&layout("orders", 2));
        assert!(disabled.unknown_entry("orders").partitions.is_empty());
    }

    #[test]
    fn test_deleting_subscription_is_not_found() {
        let fx = Fixture::new();
        let id = fx.subscribe("S1", &["orders"]);
        fx.source.put("default", "orders", 0, 1, 2);
        fx.registry.delete(&id).unwrap();

        let result = fx.aggregator(fast_config()).compute_stats(&id, StatsMode::Normal);
        assert!(matches!(
            result,
            Err(SubscriptionError::SubscriptionNotFound(_))
        ));
    }

    #[test]
    fn test_workers_exit_after_request() {
        let fx = Fixture::new();
        let id = fx.subscribe("S1", &["a", "b", "c", "d"]);
        for et in ["a", "b", "c", "d"] {
            fx.source.put("default", et, 0, 0, 3);
        }
        let aggregator = fx.aggregator(fast_config());
        aggregator.compute_stats(&id, StatsMode::Normal).unwrap();

        for _ in 0..100 {
            if aggregator.active_workers() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(aggregator.active_workers(), 0);
    }
}
