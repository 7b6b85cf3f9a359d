use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pressflow_core::{RunId, WorkerId};
use pressflow_events::{ExecutionEvent, ExecutionEventBus, ExecutionEventType};
use pressflow_infra::jobs::{BackoffPolicy, InMemoryJobRepository, JobQueue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn bench_enqueue_claim_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_claim_ack", |b| {
        let queue = JobQueue::new(InMemoryJobRepository::new());
        let worker = WorkerId::new("bench-0").unwrap();
        b.iter(|| {
            let job = queue
                .enqueue("bench.noop", serde_json::json!({"n": 1}), 3)
                .unwrap();
            let claimed = queue.claim(&worker).unwrap().unwrap();
            queue.ack(claimed.id, &worker).unwrap();
            black_box(job.id);
        });
    });

    group.bench_function("enqueue_claim_retry", |b| {
        let queue = JobQueue::new(InMemoryJobRepository::new());
        let worker = WorkerId::new("bench-0").unwrap();
        let backoff = BackoffPolicy::immediate();
        b.iter(|| {
            queue.enqueue("bench.flaky", serde_json::json!({}), 1).unwrap();
            let claimed = queue.claim(&worker).unwrap().unwrap();
            black_box(queue.retry(claimed.id, &worker, "boom", &backoff).unwrap());
        });
    });

    group.finish();
}

fn bench_claim_with_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_with_backlog");

    for backlog in [10usize, 100, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &backlog| {
            let queue = JobQueue::new(InMemoryJobRepository::new());
            let worker = WorkerId::new("bench-0").unwrap();
            for _ in 0..backlog {
                queue.enqueue("bench.noop", serde_json::json!({}), 1).unwrap();
            }
            b.iter(|| {
                // Keep the backlog size stable: claim one, ack it, add one.
                let claimed = queue.claim(&worker).unwrap().unwrap();
                queue.ack(claimed.id, &worker).unwrap();
                queue.enqueue("bench.noop", serde_json::json!({}), 1).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_event_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_fan_out");

    for subscribers in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            subscribers,
            |b, &subscribers| {
                let bus = ExecutionEventBus::new();
                let run_id = RunId::new("run-bench").unwrap();
                let delivered = Arc::new(AtomicU64::new(0));
                let _subscriptions: Vec<_> = (0..subscribers)
                    .map(|_| {
                        let delivered = delivered.clone();
                        bus.subscribe(run_id.clone(), move |_event| {
                            delivered.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        })
                    })
                    .collect();
                let event = ExecutionEvent::new(ExecutionEventType::LogAppended, run_id.clone())
                    .with_payload(serde_json::json!({"line": "scoring article"}));

                b.iter(|| bus.publish(black_box(&event)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_claim_ack,
    bench_claim_with_backlog,
    bench_event_fan_out
);
criterion_main!(benches);
