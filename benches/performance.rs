//! Performance benchmarks for subscription stats.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use substats::{
    FixedClock, ListQuery, MemoryOffsetSource, MemoryTimestampResolver, StatsAggregator,
    StatsConfig, StatsMode, SubscriptionId, SubscriptionInput, SubscriptionRegistry, Timestamp,
};

const PARTITIONS: u32 = 8;

fn setup(event_types: usize) -> (StatsAggregator, SubscriptionId) {
    let registry = Arc::new(SubscriptionRegistry::new());
    let source = Arc::new(MemoryOffsetSource::new());
    let resolver = Arc::new(MemoryTimestampResolver::new());

    let names: Vec<String> = (0..event_types).map(|i| format!("event-{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (sub, _) = registry
        .create(SubscriptionInput::new("bench", &refs))
        .unwrap();

    for name in &names {
        for p in 0..PARTITIONS {
            source.put("default", name, p, 100, 100 + p as u64);
            resolver.set_timestamp(name, p, 100, Timestamp(1_000));
        }
    }

    let stats = StatsAggregator::new(registry, source, resolver, StatsConfig::default())
        .unwrap()
        .with_clock(Arc::new(FixedClock(Timestamp(5_000))));
    (stats, sub.id)
}

/// Benchmark a normal-mode request across fan-out widths
fn bench_compute_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_stats");

    for event_types in [1, 8, 32, 128] {
        group.bench_with_input(
            BenchmarkId::new("event_types", event_types),
            &event_types,
            |b, &n| {
                let (stats, id) = setup(n);
                b.iter(|| {
                    black_box(stats.compute_stats(&id, StatsMode::Normal).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark time-lag requests; lookups after the first iteration hit the cache
fn bench_time_lag(c: &mut Criterion) {
    let mut group = c.benchmark_group("time_lag");

    for event_types in [1, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("event_types", event_types),
            &event_types,
            |b, &n| {
                let (stats, id) = setup(n);
                b.iter(|| {
                    black_box(stats.compute_stats(&id, StatsMode::TimeLag).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark paging through a populated registry
fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("list");

    for count in [100, 1_000, 10_000] {
        let registry = SubscriptionRegistry::new();
        for i in 0..count {
            let event_type = format!("stream-{}", i);
            registry
                .create(SubscriptionInput::new(
                    format!("app-{}", i % 10),
                    &[event_type.as_str()],
                ))
                .unwrap();
        }

        group.bench_with_input(BenchmarkId::new("subscriptions", count), &count, |b, _| {
            b.iter(|| {
                let page = registry
                    .list(&ListQuery::page(50, 0).owning_application("app-3"))
                    .unwrap();
                black_box(page);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compute_stats, bench_time_lag, bench_list);
criterion_main!(benches);
