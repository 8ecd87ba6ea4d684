//! Per-event-type fetch task.

use super::collector::TaskOutcome;
use crate::governor::{AvailabilityGovernor, CancellationToken, FailureClass, RetryError, StaleReport};
use crate::source::{LagTimestampResolver, PartitionOffsetSource};
use crate::types::{
    Clock, EventTypeState, PartitionId, PartitionOffset, PartitionStat, PartitionState,
    StatsMode, SubscriptionEventTypeStats, Timestamp,
};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

/// Everything a task needs, shared by all workers of one request.
pub(crate) struct TaskContext {
    pub source: Arc<dyn PartitionOffsetSource>,
    pub resolver: Arc<dyn LagTimestampResolver>,
    pub governor: AvailabilityGovernor,
    pub clock: Arc<dyn Clock>,
    pub consumer_group: String,
    pub mode: StatsMode,
    pub timelag_concurrency: usize,
    pub token: CancellationToken,
}

/// How a task ended.
#[derive(Debug)]
pub(crate) enum TaskResult {
    Done(TaskOutcome),
    /// Stopped by the request deadline; reports nothing.
    Cancelled,
}

/// Merged readings of one event type across fetch attempts.
struct Fetched {
    offsets: BTreeMap<PartitionId, PartitionOffset>,
    unreachable: BTreeSet<PartitionId>,
    stale: StaleReport,
}

enum FetchStop {
    Failed(FailureClass, String),
    Cancelled,
}

/// Fetch offsets, compute lag, and (in TIMELAG mode) resolve time lag for
/// one event type.
pub(crate) fn run(ctx: &TaskContext, event_type: &str) -> TaskResult {
    let fetched = match fetch_offsets(ctx, event_type) {
        Ok(fetched) => fetched,
        Err(FetchStop::Cancelled) => return TaskResult::Cancelled,
        Err(FetchStop::Failed(class, reason)) => {
            return TaskResult::Done(TaskOutcome::Failed { class, reason })
        }
    };

    let class = ctx.governor.classify_reading(&fetched.stale);
    let inconsistent = class == Some(FailureClass::StaleSnapshot);
    if inconsistent {
        tracing::warn!(
            event_type,
            ?class,
            stale = fetched.stale.stale.len(),
            partitions = fetched.stale.total,
            "most partition snapshots are stale"
        );
    }

    let mut partitions = partition_stats(event_type, &fetched);

    if ctx.mode.wants_time_lag()
        && !fill_time_lag(ctx, event_type, &fetched.offsets, &mut partitions)
    {
        return TaskResult::Cancelled;
    }

    if ctx.token.is_cancelled() {
        return TaskResult::Cancelled;
    }

    let degraded = inconsistent || partitions.iter().any(|p| p.state != PartitionState::Ok);
    TaskResult::Done(TaskOutcome::Resolved(SubscriptionEventTypeStats {
        event_type: event_type.to_string(),
        state: if degraded {
            EventTypeState::Degraded
        } else {
            EventTypeState::Ok
        },
        inconsistent,
        partitions,
    }))
}

/// Read offsets, retrying on transient errors, unreachable partitions, and
/// stale majorities until the attempt budget runs out.
fn fetch_offsets(ctx: &TaskContext, event_type: &str) -> Result<Fetched, FetchStop> {
    let governor = &ctx.governor;
    let mut offsets: BTreeMap<PartitionId, PartitionOffset> = BTreeMap::new();
    let mut unreachable: BTreeSet<PartitionId> = BTreeSet::new();
    let mut attempts = 0;

    loop {
        if ctx.token.is_cancelled() {
            return Err(FetchStop::Cancelled);
        }
        attempts += 1;

        let retry_reason = match ctx.source.fetch(&ctx.consumer_group, event_type) {
            Ok(batch) => {
                for offset in batch.offsets {
                    unreachable.remove(&offset.partition);
                    offsets.insert(offset.partition, offset);
                }
                for partition in batch.unreachable {
                    // An earlier attempt may already have reached it.
                    if !offsets.contains_key(&partition) {
                        unreachable.insert(partition);
                    }
                }

                let stale = governor.detect_stale(offsets.values());
                let reason = if let Some(class) = governor.classify_reading(&stale) {
                    format!(
                        "{:?}: {} of {} snapshots stale",
                        class,
                        stale.stale.len(),
                        stale.total
                    )
                } else if !unreachable.is_empty() {
                    format!("{} partitions unreachable", unreachable.len())
                } else {
                    return Ok(Fetched {
                        offsets,
                        unreachable,
                        stale,
                    });
                };

                if !governor.should_retry(attempts) {
                    return Ok(Fetched {
                        offsets,
                        unreachable,
                        stale,
                    });
                }
                reason
            }
            Err(err) => match governor.classify(&err) {
                FailureClass::Permanent => {
                    tracing::debug!(event_type, error = %err, "event type not found");
                    return Err(FetchStop::Failed(FailureClass::Permanent, err.to_string()));
                }
                class => {
                    if !governor.should_retry(attempts) {
                        if offsets.is_empty() && unreachable.is_empty() {
                            return Err(FetchStop::Failed(
                                class,
                                format!("{} after {} attempts", err, attempts),
                            ));
                        }
                        // Keep what earlier attempts reached.
                        let stale = governor.detect_stale(offsets.values());
                        return Ok(Fetched {
                            offsets,
                            unreachable,
                            stale,
                        });
                    }
                    err.to_string()
                }
            },
        };

        tracing::debug!(event_type, attempt = attempts, reason = %retry_reason, "refetching offsets");
        if !governor.backoff(attempts, &ctx.token) {
            return Err(FetchStop::Cancelled);
        }
    }
}

/// Unconsumed counts in ascending partition order.
fn partition_stats(event_type: &str, fetched: &Fetched) -> Vec<PartitionStat> {
    let all: BTreeSet<PartitionId> = fetched
        .offsets
        .keys()
        .chain(fetched.unreachable.iter())
        .copied()
        .collect();

    all.into_iter()
        .map(|partition| {
            let Some(offset) = fetched.offsets.get(&partition) else {
                return PartitionStat::unknown(partition);
            };
            match offset.unconsumed() {
                Some(unconsumed) => PartitionStat {
                    partition,
                    unconsumed,
                    time_lag_ms: None,
                    state: if fetched.stale.is_stale(partition) {
                        PartitionState::Degraded
                    } else {
                        PartitionState::Ok
                    },
                },
                None => {
                    tracing::warn!(
                        event_type,
                        %partition,
                        earliest = offset.earliest,
                        committed = offset.committed,
                        newest = offset.newest,
                        "offsets violate earliest <= committed <= newest"
                    );
                    PartitionStat::unknown(partition)
                }
            }
        })
        .collect()
}

enum Lookup {
    Resolved(Timestamp),
    Failed(String),
    Cancelled,
}

/// Fill `time_lag_ms` for every partition with a known count.
///
/// Returns `false` if the request was cancelled meanwhile.
fn fill_time_lag(
    ctx: &TaskContext,
    event_type: &str,
    offsets: &BTreeMap<PartitionId, PartitionOffset>,
    partitions: &mut [PartitionStat],
) -> bool {
    // (slot in `partitions`, partition, committed offset)
    let mut jobs: Vec<(usize, PartitionId, u64)> = Vec::new();
    for (slot, stat) in partitions.iter_mut().enumerate() {
        if stat.state == PartitionState::Unknown {
            continue;
        }
        if stat.unconsumed == 0 {
            stat.time_lag_ms = Some(0);
        } else if let Some(offset) = offsets.get(&stat.partition) {
            jobs.push((slot, stat.partition, offset.committed));
        }
    }
    if jobs.is_empty() {
        return true;
    }

    let lookups = match resolve_all(ctx, event_type, &jobs) {
        Some(lookups) => lookups,
        None => return false,
    };

    let now = ctx.clock.now();
    for ((slot, partition, _), lookup) in jobs.into_iter().zip(lookups) {
        let stat = &mut partitions[slot];
        match lookup {
            Lookup::Resolved(at) => stat.time_lag_ms = Some(now.millis_since(at)),
            Lookup::Failed(reason) => {
                tracing::warn!(event_type, %partition, %reason, "time lag unavailable");
                stat.state = PartitionState::Degraded;
            }
            Lookup::Cancelled => return false,
        }
    }
    true
}

/// Resolve every job, fanning out to at most `timelag_concurrency` lanes.
///
/// The calling thread always works one lane itself. Returns `None` if the
/// request was cancelled.
fn resolve_all(
    ctx: &TaskContext,
    event_type: &str,
    jobs: &[(usize, PartitionId, u64)],
) -> Option<Vec<Lookup>> {
    let (job_tx, job_rx) = crossbeam_channel::unbounded();
    for (index, &(_, partition, offset)) in jobs.iter().enumerate() {
        let _ = job_tx.send((index, partition, offset));
    }
    drop(job_tx);

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    let lanes = ctx.timelag_concurrency.min(jobs.len()).max(1);

    let lane = |jobs: Receiver<(usize, PartitionId, u64)>, results: Sender<(usize, Lookup)>| {
        while let Ok((index, partition, offset)) = jobs.recv() {
            let lookup = resolve_one(ctx, event_type, partition, offset);
            let stop = matches!(lookup, Lookup::Cancelled);
            let _ = results.send((index, lookup));
            if stop {
                break;
            }
        }
    };

    thread::scope(|scope| {
        for i in 1..lanes {
            let (jobs, results) = (job_rx.clone(), result_tx.clone());
            let spawned = thread::Builder::new()
                .name(format!("substats-timelag-{}", i))
                .spawn_scoped(scope, move || lane(jobs, results));
            if let Err(e) = spawned {
                tracing::debug!(error = %e, "timestamp lane not started; continuing with fewer");
                break;
            }
        }
        lane(job_rx.clone(), result_tx.clone());
    });
    drop(result_tx);

    let mut lookups: Vec<Option<Lookup>> = (0..jobs.len()).map(|_| None).collect();
    for (index, lookup) in result_rx.try_iter() {
        lookups[index] = Some(lookup);
    }

    if ctx.token.is_cancelled() {
        return None;
    }
    // A lane that saw cancellation may have left jobs unanswered.
    lookups
        .into_iter()
        .map(|lookup| match lookup {
            Some(Lookup::Cancelled) | None => None,
            other => other,
        })
        .collect()
}

fn resolve_one(ctx: &TaskContext, event_type: &str, partition: PartitionId, offset: u64) -> Lookup {
    let result = ctx.governor.retry("resolve_timestamp", &ctx.token, || {
        ctx.resolver.resolve_timestamp(event_type, partition, offset)
    });
    match result {
        Ok(at) => Lookup::Resolved(at),
        Err(RetryError::Cancelled) => Lookup::Cancelled,
        Err(RetryError::Permanent(err)) => Lookup::Failed(err.to_string()),
        Err(RetryError::Exhausted { attempts, last }) => {
            Lookup::Failed(format!("{} after {} attempts", last, attempts))
        }
    }
}
