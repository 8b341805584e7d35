//! End-to-end exchange execution through a running engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pnio_core::network::{HttpExchange, LoopbackExchange, Outcome};
use pnio_core::telemetry::{MetricsStore, REQUESTS_COMPLETED, REQUESTS_RECEIVED};
use pnio_core::{
    Admission, Engine, EngineConfig, EngineError, Exchange, HandlerError, NoContentListener,
    ProcessState, StatusCodeListener, Step, Workflow, WorkflowError,
};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig {
        worker_threads: 2,
        blocking_pool_size: 2,
        timeout_ms: 2_000,
        response_max_bytes: 256,
        request_max_bytes: 64,
        ..Default::default()
    }
}

fn engine<S: Send + 'static>(workflow: Workflow<S>) -> (Engine<S>, Arc<MetricsStore>) {
    engine_with(config(), workflow)
}

fn engine_with<S: Send + 'static>(
    config: EngineConfig,
    workflow: Workflow<S>,
) -> (Engine<S>, Arc<MetricsStore>) {
    let store = Arc::new(MetricsStore::new());
    let engine = Engine::with_metrics(
        config,
        workflow,
        Arc::new(StatusCodeListener::default()),
        store.clone(),
    )
    .unwrap();
    (engine, store)
}

fn send<S: Send + 'static>(engine: &Engine<S>, conn: &Arc<LoopbackExchange>, state: S) -> Admission {
    let dyn_conn: Arc<dyn HttpExchange> = conn.clone();
    engine.accept(dyn_conn, state, false).unwrap()
}

fn wait_idle<S: Send + 'static>(engine: &Engine<S>) {
    for _ in 0..200 {
        if engine.in_flight() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("engine still has {} exchanges in flight", engine.in_flight());
}

#[derive(Default)]
struct Trace {
    steps: Vec<&'static str>,
}

fn mixed_workflow() -> Workflow<Trace> {
    Workflow::builder(Step::compute("parse", |ex: &Exchange<Trace>| {
        ex.workflow_state().steps.push("parse");
        Ok(())
    }))
    .next(Step::blocking("load", |ex: &Exchange<Trace>| {
        std::thread::sleep(Duration::from_millis(5));
        ex.workflow_state().steps.push("load");
        Ok(())
    }))
    .next(Step::future("fetch", |ex: Arc<Exchange<Trace>>| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        ex.workflow_state().steps.push("fetch");
        Ok::<(), HandlerError>(())
    }))
    .next(Step::compute("render", |ex: &Exchange<Trace>| {
        let body = ex.workflow_state().steps.join(",");
        ex.response().set_content_type("text/plain");
        ex.write(body.as_bytes())
    }))
    .build()
}

#[test]
fn test_mixed_workflow_runs_every_step_in_order() {
    let (engine, store) = engine(mixed_workflow());
    let conn = Arc::new(LoopbackExchange::new("/mixed", b"hi".to_vec()));
    assert!(send(&engine, &conn, Trace::default()).is_queued());

    let Some(Outcome::Sent(resp)) = conn.wait(WAIT) else {
        panic!("expected a full response, got {:?}", conn.outcome());
    };
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"parse,load,fetch");
    assert_eq!(resp.content_type.as_deref(), Some("text/plain"));

    wait_idle(&engine);
    let stats = engine.stats();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(store.counter(REQUESTS_RECEIVED), 1);
    assert_eq!(store.counter(REQUESTS_COMPLETED), 1);
}

#[test]
fn test_many_exchanges_each_dispatch_once() {
    let (engine, _) = engine(mixed_workflow());
    let conns: Vec<_> = (0..40)
        .map(|i| Arc::new(LoopbackExchange::new(format!("/many/{i}"), Vec::new())))
        .collect();
    for conn in &conns {
        send(&engine, conn, Trace::default());
    }
    for conn in &conns {
        assert_eq!(conn.wait(WAIT).and_then(|o| o.status()), Some(200));
    }
    wait_idle(&engine);
    for conn in &conns {
        assert_eq!(conn.write_count(), 1);
    }
    assert_eq!(engine.stats().completed, 40);
}

#[test]
fn test_oversized_request_never_reaches_a_step() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let wf = Workflow::builder(Step::compute("count", move |_: &Exchange<()>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }))
    .build();
    let (engine, _) = engine(wf);

    let conn = Arc::new(LoopbackExchange::new("/big", vec![0u8; 65]));
    let admission = send(&engine, &conn, ());
    assert_eq!(
        admission,
        Admission::Refused { id: admission.id(), state: ProcessState::RequestBufferOverflow }
    );
    assert_eq!(conn.outcome(), Some(Outcome::NoBody(413)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(engine.stats().request_overflow, 1);
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn test_handler_failures_map_to_terminal_states() {
    let wf = Workflow::builder(Step::compute("route", |ex: &Exchange<()>| {
        match ex.query_parameter("fail").as_deref() {
            Some("error") => Err(HandlerError::failed("bad input")),
            Some("overflow") => ex.write(&[b'x'; 512]),
            Some("panic") => panic!("handler bug"),
            Some("io-timeout") => Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into()),
            _ => ex.write(b"fine"),
        }
    }))
    .build();
    let (engine, _) = engine(wf);

    let cases = [("error", 500), ("overflow", 500), ("panic", 500), ("io-timeout", 504), ("none", 200)];
    for (mode, status) in cases {
        let conn = Arc::new(LoopbackExchange::new("/route", Vec::new()).with_query("fail", mode));
        send(&engine, &conn, ());
        assert_eq!(conn.wait(WAIT).and_then(|o| o.status()), Some(status), "mode {mode}");
    }
    wait_idle(&engine);
    let stats = engine.stats();
    assert_eq!(stats.excepted, 2);
    assert_eq!(stats.response_overflow, 1);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn test_failing_step_stops_the_workflow() {
    let later = Arc::new(AtomicUsize::new(0));
    let seen = later.clone();
    let wf = Workflow::builder(Step::compute("fail", |_: &Exchange<()>| Err(HandlerError::failed("no"))))
        .next(Step::compute("after", move |_: &Exchange<()>| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build();
    let (engine, _) = engine(wf);
    let conn = Arc::new(LoopbackExchange::new("/stop", Vec::new()));
    send(&engine, &conn, ());
    assert_eq!(conn.wait(WAIT), Some(Outcome::NoBody(500)));
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[test]
fn test_async_failure_is_an_exception() {
    let wf = Workflow::builder(Step::future("remote", |_: Arc<Exchange<()>>| async {
        Err::<(), HandlerError>(HandlerError::failed("upstream 502"))
    }))
    .build();
    let (engine, _) = engine(wf);
    let conn = Arc::new(LoopbackExchange::new("/remote", Vec::new()));
    send(&engine, &conn, ());
    assert_eq!(conn.wait(WAIT), Some(Outcome::NoBody(500)));
}

#[test]
fn test_connection_closed_skips_listener() {
    let wf = Workflow::builder(Step::blocking("slow", |ex: &Exchange<()>| {
        while !ex.is_cancelled() {
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }))
    .build();
    let (engine, _) = engine(wf);
    let conn = Arc::new(LoopbackExchange::new("/gone", Vec::new()));
    let id = send(&engine, &conn, ()).id();

    std::thread::sleep(Duration::from_millis(20));
    assert!(engine.connection_closed(id));
    assert_eq!(conn.wait(WAIT), Some(Outcome::Closed));
    wait_idle(&engine);
    assert!(!engine.connection_closed(id));
    assert_eq!(engine.stats().connection_closed, 1);
}

#[test]
fn test_hot_swap_keeps_in_flight_snapshot() {
    let wf = Workflow::builder(Step::blocking("v1", |ex: &Exchange<()>| {
        std::thread::sleep(Duration::from_millis(40));
        ex.write(b"v1")
    }))
    .build();
    let (engine, _) = engine(wf);

    let first = Arc::new(LoopbackExchange::new("/swap", Vec::new()));
    send(&engine, &first, ());
    std::thread::sleep(Duration::from_millis(10));

    let previous = engine
        .update_workflow(Workflow::builder(Step::compute("v2", |ex: &Exchange<()>| ex.write(b"v2"))).build())
        .unwrap();
    assert_eq!(previous.descriptions(), vec!["v1"]);

    let second = Arc::new(LoopbackExchange::new("/swap", Vec::new()));
    send(&engine, &second, ());

    let body = |conn: &LoopbackExchange| match conn.wait(WAIT) {
        Some(Outcome::Sent(resp)) => resp.body,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(body(&first), b"v1");
    assert_eq!(body(&second), b"v2");
}

#[test]
fn test_blocking_steps_need_a_pool() {
    let wf = Workflow::builder(Step::blocking("disk", |_: &Exchange<()>| Ok(()))).build();
    let cfg = EngineConfig { blocking_pool_size: 0, worker_threads: 1, ..Default::default() };
    let err = Engine::new(cfg, wf, Arc::new(StatusCodeListener::default())).err();
    assert!(matches!(
        err,
        Some(EngineError::Workflow(WorkflowError::BlockingStepWithoutPool { .. }))
    ));

    let cfg = EngineConfig { blocking_pool_size: 0, worker_threads: 1, ..Default::default() };
    let engine = Engine::new(cfg, Workflow::<()>::empty(), Arc::new(StatusCodeListener::default())).unwrap();
    let swap = engine.update_workflow(Workflow::builder(Step::blocking("disk", |_: &Exchange<()>| Ok(()))).build());
    assert!(swap.is_err());
}

#[test]
fn test_invalid_config_is_rejected() {
    let cfg = EngineConfig { timeout_ms: 0, ..Default::default() };
    let err = Engine::new(cfg, Workflow::<()>::empty(), Arc::new(StatusCodeListener::default())).err();
    assert!(matches!(err, Some(EngineError::Config(_))));
}

#[test]
fn test_empty_workflow_finishes_with_no_content() {
    let engine = Engine::new(config(), Workflow::<()>::empty(), Arc::new(NoContentListener)).unwrap();
    let conn = Arc::new(LoopbackExchange::new("/empty", Vec::new()));
    send(&engine, &conn, ());
    let Some(Outcome::Sent(resp)) = conn.wait(WAIT) else {
        panic!("expected a response");
    };
    assert_eq!(resp.status, 204);
    assert!(resp.body.is_empty());
}

#[test]
fn test_introspection_lists_live_exchanges() {
    let wf = Workflow::builder(Step::blocking("hold", |ex: &Exchange<()>| {
        while ex.query_parameter("hold").is_some() && !ex.is_cancelled() {
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }))
    .build();
    let (engine, _) = engine_with(EngineConfig { response_max_bytes: 16 * 1024, ..config() }, wf);
    let held = Arc::new(LoopbackExchange::new("/held", Vec::new()).with_query("hold", "1"));
    let id = send(&engine, &held, ()).id();

    let live = engine.live_exchanges();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, id);
    assert_eq!(live[0].uri, "/held");
    assert_eq!(live[0].state, ProcessState::Running);

    engine
        .update_workflow(Workflow::builder(engine.introspection_step()).build())
        .unwrap();
    let probe = Arc::new(LoopbackExchange::new("/debug/exchanges", Vec::new()));
    send(&engine, &probe, ());
    let Some(Outcome::Sent(resp)) = probe.wait(WAIT) else {
        panic!("expected listing");
    };
    let listing: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    let uris: Vec<_> = listing["exchanges"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["uri"].as_str().unwrap().to_owned())
        .collect();
    assert!(uris.contains(&"/held".to_string()));
    assert!(uris.contains(&"/debug/exchanges".to_string()));

    engine.connection_closed(id);
}
