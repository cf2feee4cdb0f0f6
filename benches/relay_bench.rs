//! Benchmarks for the relay hot paths.
//!
//! Benchmarks cover:
//! - Broker send/receive/acknowledge, inline and offloaded
//! - Ledger admission for fresh and finished keys
//! - Autoscaler decisions

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use prometheus_task_relay::core::{
    Autoscaler, AutoscalerPolicy, BrokerSettings, IdempotencyLedger, QueueBroker,
    QueueDepthSample, TaskMessage, TerminalWrite,
};
use prometheus_task_relay::infra::{InMemoryFleet, InMemoryLedger, InMemoryObjectStore, InMemoryQueue};
use prometheus_task_relay::util::backoff::RetryPolicy;
use prometheus_task_relay::util::serde::{LogicalKey, TaskId};

use tokio::runtime::Runtime;

// ============================================================================
// Helper Functions
// ============================================================================

fn build_broker(inline_limit_bytes: usize) -> QueueBroker {
    let settings = BrokerSettings {
        inline_limit_bytes,
        retry: RetryPolicy::no_retry(),
        ..BrokerSettings::default()
    };
    QueueBroker::new(
        Arc::new(InMemoryQueue::new("bench")),
        Arc::new(InMemoryObjectStore::new()),
        settings,
    )
    .unwrap()
}

fn build_message(id: u64, size: usize) -> TaskMessage {
    TaskMessage::new(
        TaskId::from(format!("task-{id}")),
        LogicalKey::new(format!("key-{id}")),
        vec![b'x'; size],
    )
}

// ============================================================================
// Broker Benchmarks
// ============================================================================

fn bench_broker_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_round_trip");

    for size in [256_usize, 4 * 1024, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("inline", size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let broker = build_broker(256 * 1024);
                broker.send(build_message(1, size)).await.unwrap();
                let deliveries = broker.receive(1, Duration::ZERO).await.unwrap();
                for delivery in &deliveries {
                    broker.acknowledge(delivery).await.unwrap();
                }
                black_box(deliveries);
            });
        });
        group.bench_with_input(BenchmarkId::new("offloaded", size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let broker = build_broker(128);
                broker.send(build_message(1, size)).await.unwrap();
                let deliveries = broker.receive(1, Duration::ZERO).await.unwrap();
                for delivery in &deliveries {
                    broker.acknowledge(delivery).await.unwrap();
                }
                black_box(deliveries);
            });
        });
    }

    group.finish();
}

fn bench_broker_batch_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_batch_send");

    for count in [10_u64, 100, 1000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let broker = build_broker(256 * 1024);
                for id in 0..count {
                    broker.send(build_message(id, 512)).await.unwrap();
                }
                black_box(broker.depth().await.unwrap());
            });
        });
    }

    group.finish();
}

// ============================================================================
// Ledger Benchmarks
// ============================================================================

fn bench_ledger_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_admission");

    for count in [100_u64, 1000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("fresh", count), &count, |b, &count| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let ledger = InMemoryLedger::new(Duration::from_secs(60));
                for id in 0..count {
                    let key = LogicalKey::new(format!("key-{id}"));
                    black_box(ledger.try_begin(&key, &TaskId::from("t"), 0).await.unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("duplicate", count), &count, |b, &count| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let ledger = InMemoryLedger::new(Duration::from_secs(60));
                let key = LogicalKey::new("finished");
                ledger.try_begin(&key, &TaskId::from("t"), 0).await.unwrap();
                ledger
                    .complete(&key, &TaskId::from("t"), 1, TerminalWrite::success("results/finished/attempt-1"), 1)
                    .await
                    .unwrap();
                for id in 0..count {
                    let owner = TaskId::from(format!("dup-{id}"));
                    black_box(ledger.try_begin(&key, &owner, 2).await.unwrap());
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// Autoscaler Benchmarks
// ============================================================================

fn bench_autoscaler_evaluate(c: &mut Criterion) {
    let scaler = Autoscaler::new(
        AutoscalerPolicy::new("bench", 1, 100),
        build_broker(256 * 1024),
        Arc::new(InMemoryFleet::new()),
    )
    .unwrap();

    c.bench_function("autoscaler_evaluate", |b| {
        b.iter(|| {
            for visible in [0_u64, 7, 19, 21, 500, 10_000] {
                let sample = QueueDepthSample {
                    visible,
                    in_flight: 0,
                    sampled_at_ms: 0,
                };
                black_box(scaler.evaluate(&sample, black_box(4), 0));
            }
        });
    });
}

criterion_group!(broker_benches, bench_broker_round_trip, bench_broker_batch_send);
criterion_group!(ledger_benches, bench_ledger_admission);
criterion_group!(autoscaler_benches, bench_autoscaler_evaluate);
criterion_main!(broker_benches, ledger_benches, autoscaler_benches);
