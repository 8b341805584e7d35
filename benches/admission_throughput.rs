//! Admission and end-to-end exchange throughput benchmarks.
//!
//! Measures work-queue push/pop cost and full loopback exchanges through
//! a running engine.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pnio_core::network::{HttpExchange, LoopbackExchange};
use pnio_core::scheduler::WorkQueue;
use pnio_core::telemetry::NoopSink;
use pnio_core::{Engine, EngineConfig, StatusCodeListener, Step, Workflow};

fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");

    for count in [100usize, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("normal", count), |b| {
            let queue = WorkQueue::new(count, None);
            b.iter(|| {
                for i in 0..count {
                    let _ = queue.push_normal(black_box(i));
                }
                while queue.try_pop().is_some() {}
            })
        });
        group.bench_function(BenchmarkId::new("important", count), |b| {
            let queue = WorkQueue::new(count, None);
            b.iter(|| {
                for i in 0..count {
                    let _ = queue.push_important(black_box(i));
                }
                while queue.try_pop().is_some() {}
            })
        });
    }

    group.finish();
}

fn bench_engine_exchanges(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.sample_size(20);

    let config = EngineConfig {
        worker_threads: 4,
        queue_count: 2,
        queue_capacity: 4096,
        blocking_pool_size: 0,
        ..Default::default()
    };
    let workflow = Workflow::builder(Step::compute("echo", |ex: &pnio_core::Exchange<()>| {
        let body = ex.request().to_vec();
        ex.write(&body)
    }))
    .build();
    let engine = Engine::with_metrics(
        config,
        workflow,
        Arc::new(StatusCodeListener::default()),
        Arc::new(NoopSink),
    )
    .expect("engine");

    for batch in [64usize, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(BenchmarkId::new("compute_echo", batch), |b| {
            b.iter(|| {
                let conns: Vec<Arc<LoopbackExchange>> = (0..batch)
                    .map(|i| Arc::new(LoopbackExchange::new("/echo", vec![b'a'; i % 32])))
                    .collect();
                for conn in &conns {
                    let conn: Arc<dyn HttpExchange> = conn.clone();
                    let _ = engine.accept(conn, (), false);
                }
                for conn in &conns {
                    black_box(conn.wait(Duration::from_secs(5)));
                }
            })
        });
    }

    group.finish();
    engine.shutdown(Duration::from_secs(1));
}

criterion_group!(benches, bench_queue_push_pop, bench_engine_exchanges);
criterion_main!(benches);
