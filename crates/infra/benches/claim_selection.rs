use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use jobforge_core::{Job, Payload, Priority, claim_ordering};
use jobforge_infra::jobs::{InMemoryJobStore, JobStore};

fn make_jobs(count: usize) -> Vec<Job> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let priority = match i % 3 {
                0 => Priority::Low,
                1 => Priority::Medium,
                _ => Priority::High,
            };
            let job = Job::builder("bench.noop", Payload::new(), format!("bench-{i}"))
                .with_priority(priority);
            if i % 5 == 0 {
                job.scheduled_at(now - Duration::seconds(i as i64)).build()
            } else {
                job.build()
            }
        })
        .collect()
}

fn bench_claim_ordering(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_ordering");
    for size in [100usize, 1_000, 10_000] {
        let jobs = make_jobs(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &jobs, |b, jobs| {
            b.iter(|| {
                let best = jobs.iter().min_by(|a, b| claim_ordering(a, b));
                black_box(best.map(Job::id))
            })
        });
    }
    group.finish();
}

fn bench_in_memory_drain(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime");

    let mut group = c.benchmark_group("in_memory_drain");
    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let store = InMemoryJobStore::new();
                    runtime.block_on(async {
                        for job in make_jobs(size) {
                            store.enqueue(job).await.expect("enqueue");
                        }
                    });
                    store
                },
                |store| {
                    runtime.block_on(async {
                        let now = Utc::now();
                        while let Some(job) = store.claim_next(now).await.expect("claim") {
                            black_box(job.id());
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_claim_ordering, bench_in_memory_drain);
criterion_main!(benches);
