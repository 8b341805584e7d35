//! Live-exchange listing for an introspection endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HandlerError;
use crate::exchange::{Exchange, LiveRegistry, ProcessState};
use crate::listener::{ExchangeListener, Reply, StatusCodeListener};
use crate::network::Response;
use crate::workflow::Step;

/// Point-in-time view of one live exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeSnapshot {
    pub id: u64,
    pub state: ProcessState,
    pub uri: String,
    pub created_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Negative once the deadline has passed.
    pub remaining_ms: i64,
}

impl ExchangeSnapshot {
    pub fn of<S>(exchange: &Exchange<S>) -> Self {
        Self {
            id: exchange.id(),
            state: exchange.process_state(),
            uri: exchange.uri().to_owned(),
            created_at: exchange.created_at(),
            elapsed_ms: u64::try_from(exchange.elapsed().as_millis()).unwrap_or(u64::MAX),
            remaining_ms: exchange.time_left() / 1_000_000,
        }
    }
}

/// Snapshot every registered exchange, ordered by id.
pub fn snapshot_all<S>(registry: &LiveRegistry<S>) -> Vec<ExchangeSnapshot> {
    let mut all: Vec<_> = registry.exchanges().iter().map(|ex| ExchangeSnapshot::of(&**ex)).collect();
    all.sort_by_key(|s| s.id);
    all
}

/// JSON body listing `snapshots`.
pub fn render_json(snapshots: &[ExchangeSnapshot]) -> Result<Vec<u8>, HandlerError> {
    #[derive(Serialize)]
    struct Body<'a> {
        count: usize,
        exchanges: &'a [ExchangeSnapshot],
    }
    serde_json::to_vec(&Body { count: snapshots.len(), exchanges: snapshots })
        .map_err(|e| HandlerError::failed(format!("introspection render: {e}")))
}

/// Compute step writing the live-exchange listing into the response buffer.
pub fn introspection_step<S: Send + 'static>(registry: LiveRegistry<S>) -> Step<S> {
    Step::compute("introspection", move |exchange: &Exchange<S>| {
        let body = render_json(&snapshot_all(&registry))?;
        let mut response = exchange.response();
        response.set_content_type("application/json");
        response.set_body(&body)
    })
}

/// Listener that answers every successful exchange with the live-exchange
/// listing, rendered at dispatch time. Other states map as
/// [`StatusCodeListener`] does.
pub struct IntrospectionListener<S> {
    registry: LiveRegistry<S>,
    fallback: StatusCodeListener,
}

impl<S> IntrospectionListener<S> {
    pub fn new(registry: LiveRegistry<S>) -> Self {
        Self { registry, fallback: StatusCodeListener::default() }
    }
}

impl<S: Send> ExchangeListener<S> for IntrospectionListener<S> {
    fn on_done(&self, _: &Exchange<S>) -> Reply {
        match render_json(&snapshot_all(&self.registry)) {
            Ok(body) => Reply::Full(Response {
                status: 200,
                content_type: Some("application/json".into()),
                body,
                ..Default::default()
            }),
            Err(e) => {
                tracing::warn!(error = %e, "introspection render failed");
                Reply::NoBody(self.fallback.exception)
            }
        }
    }

    fn on_timeout(&self, ex: &Exchange<S>) -> Reply {
        self.fallback.on_timeout(ex)
    }

    fn on_exception(&self, ex: &Exchange<S>) -> Reply {
        self.fallback.on_exception(ex)
    }

    fn on_request_buffer_overflow(&self, ex: &Exchange<S>) -> Reply {
        self.fallback.on_request_buffer_overflow(ex)
    }

    fn on_response_buffer_overflow(&self, ex: &Exchange<S>) -> Reply {
        self.fallback.on_response_buffer_overflow(ex)
    }

    fn on_rejected(&self, ex: &Exchange<S>) -> Reply {
        self.fallback.on_rejected(ex)
    }

    fn on_interrupted(&self, ex: &Exchange<S>) -> Reply {
        self.fallback.on_interrupted(ex)
    }
}
