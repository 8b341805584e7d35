//! Engine metrics: named counters, the in-flight gauge and exchange latency.
//!
//! The engine owns its counters and reports through an injected
//! [`MetricsSink`], so two engines in one process never share state.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::exchange::ProcessState;

pub const REQUESTS_RECEIVED: &str = "pnio_requests_received_total";
pub const REQUESTS_COMPLETED: &str = "pnio_requests_completed_total";
pub const REQUESTS_REJECTED: &str = "pnio_requests_rejected_total";
pub const REQUESTS_TIMED_OUT: &str = "pnio_requests_timed_out_total";
pub const REQUESTS_EXCEPTED: &str = "pnio_requests_excepted_total";
pub const REQUESTS_INTERRUPTED: &str = "pnio_requests_interrupted_total";
pub const REQUESTS_CLOSED: &str = "pnio_requests_connection_closed_total";
pub const REQUEST_OVERFLOWS: &str = "pnio_request_buffer_overflow_total";
pub const RESPONSE_OVERFLOWS: &str = "pnio_response_buffer_overflow_total";
pub const REQUESTS_UNKNOWN: &str = "pnio_requests_unknown_total";
pub const IN_FLIGHT: &str = "pnio_exchanges_in_flight";
pub const EXCHANGE_LATENCY_MS: &str = "pnio_exchange_latency_ms";

/// Destination for engine metrics.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str);

    fn gauge(&self, name: &'static str, value: f64);

    fn histogram(&self, name: &'static str, value: f64);
}

/// Forwards to the `metrics` crate facade and whatever recorder is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeSink;

impl MetricsSink for FacadeSink {
    fn increment(&self, name: &'static str) {
        metrics::counter!(name).increment(1);
    }

    fn gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }

    fn histogram(&self, name: &'static str, value: f64) {
        metrics::histogram!(name).record(value);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _: &'static str) {}
    fn gauge(&self, _: &'static str, _: f64) {}
    fn histogram(&self, _: &'static str, _: f64) {}
}

/// Counter name recorded for a terminal state.
pub fn counter_for(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Done => REQUESTS_COMPLETED,
        ProcessState::Timeout => REQUESTS_TIMED_OUT,
        ProcessState::Interrupted => REQUESTS_INTERRUPTED,
        ProcessState::Exception => REQUESTS_EXCEPTED,
        ProcessState::ConnectionClosed => REQUESTS_CLOSED,
        ProcessState::Rejected => REQUESTS_REJECTED,
        ProcessState::RequestBufferOverflow => REQUEST_OVERFLOWS,
        ProcessState::ResponseBufferOverflow => RESPONSE_OVERFLOWS,
        ProcessState::Running | ProcessState::Unknown => REQUESTS_UNKNOWN,
    }
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub received: u64,
    pub completed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub excepted: u64,
    pub interrupted: u64,
    pub connection_closed: u64,
    pub request_overflow: u64,
    pub response_overflow: u64,
    pub unknown: u64,
    pub in_flight: i64,
}

/// Engine-owned counters mirrored into a [`MetricsSink`].
#[derive(Debug, Default)]
pub struct EngineCounters {
    received: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    excepted: AtomicU64,
    interrupted: AtomicU64,
    connection_closed: AtomicU64,
    request_overflow: AtomicU64,
    response_overflow: AtomicU64,
    unknown: AtomicU64,
    in_flight: AtomicI64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self, sink: &dyn MetricsSink) {
        self.received.fetch_add(1, Ordering::Relaxed);
        sink.increment(REQUESTS_RECEIVED);
    }

    pub fn enter(&self, sink: &dyn MetricsSink) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        sink.gauge(IN_FLIGHT, now as f64);
    }

    pub fn leave(&self, sink: &dyn MetricsSink) {
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        sink.gauge(IN_FLIGHT, now as f64);
    }

    /// Count one exchange reaching `state`.
    pub fn record(&self, state: ProcessState, sink: &dyn MetricsSink) {
        let slot = match state {
            ProcessState::Done => &self.completed,
            ProcessState::Timeout => &self.timed_out,
            ProcessState::Interrupted => &self.interrupted,
            ProcessState::Exception => &self.excepted,
            ProcessState::ConnectionClosed => &self.connection_closed,
            ProcessState::Rejected => &self.rejected,
            ProcessState::RequestBufferOverflow => &self.request_overflow,
            ProcessState::ResponseBufferOverflow => &self.response_overflow,
            ProcessState::Running | ProcessState::Unknown => &self.unknown,
        };
        slot.fetch_add(1, Ordering::Relaxed);
        sink.increment(counter_for(state));
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> EngineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            received: load(&self.received),
            completed: load(&self.completed),
            rejected: load(&self.rejected),
            timed_out: load(&self.timed_out),
            excepted: load(&self.excepted),
            interrupted: load(&self.interrupted),
            connection_closed: load(&self.connection_closed),
            request_overflow: load(&self.request_overflow),
            response_overflow: load(&self.response_overflow),
            unknown: load(&self.unknown),
            in_flight: self.in_flight(),
        }
    }
}
