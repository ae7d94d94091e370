// Copyright 2025 Cowboy AI, LLC.

use chrono::{Duration, Utc};
use cim_reconcile::{
    Event, FnReducer, JsonCodec, LevelScheduler, LocalSnapshot, MonotonicEndpoint, OrderKey, SnapshotCache,
    SnapshotScheduler,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::json;
use std::sync::Arc;

fn events(count: u64) -> Vec<Event> {
    let now = Utc::now();
    (0..count)
        .map(|i| Event::new(OrderKey::new(i + 1, "bench", i), now, json!(1)))
        .collect()
}

fn benchmark_scheduler_candidates(c: &mut Criterion) {
    let scheduler = LevelScheduler::default();
    let batch = events(20_003);

    c.bench_function("scheduler_candidates_20003", |b| {
        b.iter(|| black_box(scheduler.candidates(black_box(1), &batch, None)))
    });
}

fn benchmark_cache_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_append");

    for size in [100u64, 1_000, 10_000].iter() {
        let batch = events(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut cache = SnapshotCache::new(
                    Arc::new(FnReducer::new(0i64, |sum: i64, event: &Event| {
                        Ok::<_, anyhow::Error>(sum + event.payload.as_i64().unwrap_or(0))
                    })),
                    Arc::new(LevelScheduler::new(4, 2, Duration::hours(1))),
                    Arc::new(JsonCodec::<i64>::new()),
                );
                black_box(cache.append_events(&batch).unwrap())
            })
        });
    }

    group.finish();
}

fn benchmark_endpoint_classify(c: &mut Criterion) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut chunk = events(1_000);
    chunk.shuffle(&mut rng);

    c.bench_function("endpoint_classify_shuffled_1000", |b| {
        b.iter(|| {
            let mut endpoint = MonotonicEndpoint::new(&LocalSnapshot::initial(String::new()));
            black_box(endpoint.classify(chunk.clone(), true))
        })
    });
}

criterion_group!(
    benches,
    benchmark_scheduler_candidates,
    benchmark_cache_append,
    benchmark_endpoint_classify
);
criterion_main!(benches);
