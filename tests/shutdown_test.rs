//! Engine shutdown: draining, interruption of leftovers and refusal afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pnio_core::network::{HttpExchange, LoopbackExchange, Outcome};
use pnio_core::shutdown::ShutdownResult;
use pnio_core::{Engine, EngineConfig, EngineError, Exchange, StatusCodeListener, Step, Workflow};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig {
        worker_threads: 1,
        blocking_pool_size: 1,
        timeout_ms: 10_000,
        ..Default::default()
    }
}

fn submit(engine: &Engine<()>, uri: &str) -> Arc<LoopbackExchange> {
    let conn = Arc::new(LoopbackExchange::new(uri, Vec::new()));
    let dyn_conn: Arc<dyn HttpExchange> = conn.clone();
    engine.accept(dyn_conn, (), false).unwrap();
    conn
}

/// A compute step that holds its worker until the exchange is cancelled.
fn holding_workflow(entered: Arc<AtomicUsize>) -> Workflow<()> {
    Workflow::builder(Step::compute("hold", move |ex: &Exchange<()>| {
        entered.fetch_add(1, Ordering::SeqCst);
        while !ex.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }))
    .build()
}

#[test]
fn test_shutdown_interrupts_queued_and_running() {
    let entered = Arc::new(AtomicUsize::new(0));
    let engine = Engine::new(
        config(),
        holding_workflow(entered.clone()),
        Arc::new(StatusCodeListener::default()),
    )
    .unwrap();

    let running = submit(&engine, "/running");
    while entered.load(Ordering::SeqCst) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    let queued: Vec<_> = (0..3).map(|i| submit(&engine, &format!("/queued/{i}"))).collect();

    let result = engine.shutdown(Duration::from_millis(20));
    assert_eq!(result, ShutdownResult::Timeout { remaining: 4 });

    for conn in queued.iter().chain([&running]) {
        assert_eq!(conn.wait(WAIT), Some(Outcome::NoBody(503)));
        assert_eq!(conn.write_count(), 1);
    }
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    let stats = engine.stats();
    assert_eq!(stats.interrupted, 4);
    assert_eq!(stats.in_flight, 0);
    assert!(!engine.is_running());
}

#[test]
fn test_accept_after_shutdown_fails_without_writing() {
    let engine = Engine::new(config(), Workflow::<()>::empty(), Arc::new(StatusCodeListener::default())).unwrap();
    assert_eq!(engine.shutdown(Duration::ZERO), ShutdownResult::Complete);

    let conn = Arc::new(LoopbackExchange::new("/late", Vec::new()));
    let dyn_conn: Arc<dyn HttpExchange> = conn.clone();
    let err = engine.accept(dyn_conn, (), false).unwrap_err();
    assert!(matches!(err, EngineError::Shutdown));
    assert_eq!(conn.write_count(), 0);
    assert_eq!(engine.stats().received, 0);
}

#[test]
fn test_graceful_shutdown_drains_in_flight_work() {
    let wf = Workflow::builder(Step::blocking("io", |ex: &Exchange<()>| {
        std::thread::sleep(Duration::from_millis(20));
        ex.write(b"done")
    }))
    .build();
    let engine = Engine::new(config(), wf, Arc::new(StatusCodeListener::default())).unwrap();
    let conns: Vec<_> = (0..4).map(|i| submit(&engine, &format!("/drain/{i}"))).collect();

    assert_eq!(engine.shutdown(WAIT), ShutdownResult::Complete);
    for conn in &conns {
        assert_eq!(conn.outcome().and_then(|o| o.status()), Some(200));
    }
    assert_eq!(engine.stats().completed, 4);
}

#[test]
fn test_dropping_the_engine_interrupts_live_exchanges() {
    let entered = Arc::new(AtomicUsize::new(0));
    let engine = Engine::new(
        config(),
        holding_workflow(entered.clone()),
        Arc::new(StatusCodeListener::default()),
    )
    .unwrap();
    let conn = submit(&engine, "/dropped");
    while entered.load(Ordering::SeqCst) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    drop(engine);
    assert_eq!(conn.outcome(), Some(Outcome::NoBody(503)));
}

#[test]
fn test_second_shutdown_is_a_noop() {
    let engine = Engine::new(config(), Workflow::<()>::empty(), Arc::new(StatusCodeListener::default())).unwrap();
    assert_eq!(engine.shutdown(Duration::ZERO), ShutdownResult::Complete);
    assert_eq!(engine.shutdown(Duration::ZERO), ShutdownResult::Complete);
}
