//! Telemetry: structured logging, exchange spans and metrics.

mod logging;
mod metrics;
mod spans;
mod store;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    counter_for, EngineCounters, EngineStats, FacadeSink, MetricsSink, NoopSink,
    EXCHANGE_LATENCY_MS, IN_FLIGHT, REQUESTS_CLOSED, REQUESTS_COMPLETED, REQUESTS_EXCEPTED,
    REQUESTS_INTERRUPTED, REQUESTS_RECEIVED, REQUESTS_REJECTED, REQUESTS_TIMED_OUT,
    REQUESTS_UNKNOWN, REQUEST_OVERFLOWS, RESPONSE_OVERFLOWS,
};
pub use spans::ExchangeSpan;
pub use store::{HistogramSummary, MetricsSnapshot, MetricsStore};
