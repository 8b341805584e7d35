//! In-memory [`HttpExchange`] used by tests, benches and the CLI self-test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{HttpExchange, RequestTooLarge, Response};

/// What the engine did with the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent(Response),
    NoBody(u16),
    Closed,
}

impl Outcome {
    /// Status code written, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Sent(r) => Some(r.status),
            Self::NoBody(s) => Some(*s),
            Self::Closed => None,
        }
    }
}

/// Loopback connection that records every write.
pub struct LoopbackExchange {
    uri: String,
    body: Vec<u8>,
    start: Instant,
    query: HashMap<String, String>,
    gzipped: bool,
    client_ip: Option<String>,
    user_agent: Option<String>,
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
    writes: AtomicUsize,
}

impl LoopbackExchange {
    pub fn new(uri: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::started_at(uri, body, Instant::now())
    }

    /// Loopback whose request started at `start` (which may be in the past).
    pub fn started_at(uri: impl Into<String>, body: impl Into<Vec<u8>>, start: Instant) -> Self {
        Self {
            uri: uri.into(),
            body: body.into(),
            start,
            query: HashMap::new(),
            gzipped: false,
            client_ip: None,
            user_agent: None,
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_client(mut self, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn gzipped(mut self) -> Self {
        self.gzipped = true;
        self
    }

    /// Block until the engine writes an outcome or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.ready.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().clone()
    }

    /// Number of times the engine wrote to this connection.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record(&self, outcome: Outcome) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.ready.notify_all();
    }
}

impl HttpExchange for LoopbackExchange {
    fn receive_request_bytes(&self, max_size: usize) -> Result<Vec<u8>, RequestTooLarge> {
        if self.body.len() > max_size {
            return Err(RequestTooLarge { limit: max_size });
        }
        Ok(self.body.clone())
    }

    fn request_start(&self) -> Instant {
        self.start
    }

    fn is_gzipped(&self) -> bool {
        self.gzipped
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn client_ip(&self) -> Option<String> {
        self.client_ip.clone()
    }

    fn user_agent(&self) -> Option<String> {
        self.user_agent.clone()
    }

    fn query_parameter(&self, name: &str) -> Option<String> {
        self.query.get(name).cloned()
    }

    fn send(&self, response: Response) {
        self.record(Outcome::Sent(response));
    }

    fn end_exchange_no_body(&self, status: u16) {
        self.record(Outcome::NoBody(status));
    }

    fn close_connection(&self) {
        self.record(Outcome::Closed);
    }
}
