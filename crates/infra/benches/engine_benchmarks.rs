use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use pds_core::{JobId, PdsJob};
use pds_infra::adapters::{adapter_executor, AdapterError};
use pds_infra::jobs::{InMemoryJobStore, JobClaimer, JobStore};

fn store_with_backlog(size: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    for _ in 0..size {
        let mut job = PdsJob::new(JobId::new(), "bench", "{}");
        job.mark_ready_to_start().unwrap();
        store.create(job).unwrap();
    }
    store
}

fn bench_claim_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_throughput");

    for backlog in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::new("drain_backlog", backlog), backlog, |b, &size| {
            b.iter_batched(
                || store_with_backlog(size),
                |store| {
                    let claimer = JobClaimer::new(store, "bench-server");
                    while let Some(job) = claimer.claim_next_runnable_job().unwrap() {
                        black_box(job);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_optimistic_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimistic_save");

    group.bench_function("save_same_record", |b| {
        let store = InMemoryJobStore::new();
        let mut job = store.create(PdsJob::new(JobId::new(), "bench", "{}")).unwrap();
        b.iter(|| {
            job = store.save(black_box(&job)).unwrap();
        });
    });

    group.finish();
}

fn bench_resilient_happy_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("resilient_executor");
    group.sample_size(1000);

    // Consultants are only asked on failure; this measures the wrapper cost.
    group.bench_function("success_without_consulting", |b| {
        let executor = adapter_executor("bench-target");
        b.iter(|| {
            let result: Result<u64, AdapterError> = executor.execute_resilient(|| Ok(black_box(42)));
            black_box(result.unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_throughput,
    bench_optimistic_save,
    bench_resilient_happy_path
);
criterion_main!(benches);
