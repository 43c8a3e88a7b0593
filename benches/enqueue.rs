//! Benchmarks for the producer-facing enqueue path and batch draining.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use femtoexport::{
    BoundedQueue, CustomEvent, Envelope, EventTransform, ExportConfig, FemtoTelemetryHandler,
    TransformContext, TransmitOutcome,
};

fn accepting(_: &[Envelope]) -> TransmitOutcome {
    TransmitOutcome::Accepted
}

fn queue_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("try_enqueue_full_queue", |b| {
        let queue = BoundedQueue::new(1);
        queue.enqueue(0u64);
        b.iter(|| black_box(queue.try_enqueue(black_box(1u64))));
    });

    for batch in [1usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("enqueue_then_drain", batch),
            &batch,
            |b, &batch| {
                let queue = BoundedQueue::new(batch);
                b.iter_custom(|iters| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let start = Instant::now();
                        for i in 0..batch {
                            queue.enqueue(i);
                        }
                        let drained = queue.dequeue_batch(batch, Duration::ZERO);
                        total += start.elapsed();
                        black_box(drained);
                    }
                    total
                });
            },
        );
    }
    group.finish();
}

fn handler_benchmarks(c: &mut Criterion) {
    let handler = FemtoTelemetryHandler::builder(
        EventTransform::new(TransformContext::default()),
        Arc::new(accepting),
    )
    .with_config(ExportConfig {
        queue_capacity: 65_536,
        enable_local_storage: false,
        ..ExportConfig::default()
    })
    .build()
    .expect("build handler");

    let mut group = c.benchmark_group("handler");
    group.throughput(Throughput::Elements(1));
    group.bench_function("emit_custom_event", |b| {
        b.iter(|| black_box(handler.emit(CustomEvent::new("bench"))));
    });
    group.finish();
    handler.close();
}

criterion_group!(benches, queue_benchmarks, handler_benchmarks);
criterion_main!(benches);
