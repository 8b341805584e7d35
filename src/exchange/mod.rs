//! Per-request exchange context.
//!
//! An exchange carries the deadline, buffers and process state of one
//! request. Terminal transitions are written once; the listener is invoked
//! once, no matter how many paths race to complete or dispatch it.

mod buffer;
mod registry;
mod state;

pub use buffer::ResponseBuffer;
pub use registry::LiveRegistry;
pub use state::{AtomicProcessState, ProcessState};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{ExchangeError, HandlerError};
use crate::listener::{self, ExchangeListener};
use crate::network::HttpExchange;

/// Runs once after the listener has produced the response.
pub type TerminalCallback<S> = Box<dyn FnOnce(&Exchange<S>) + Send>;

/// Mutable context of one request.
pub struct Exchange<S> {
    id: u64,
    created_at: DateTime<Utc>,
    request_start: Instant,
    timeout: Duration,
    uri: String,
    request: Vec<u8>,
    response: Mutex<ResponseBuffer>,
    state: AtomicProcessState,
    cause: Mutex<Option<HandlerError>>,
    dispatched: AtomicBool,
    on_terminal: Mutex<Option<TerminalCallback<S>>>,
    workflow_state: Mutex<S>,
    cancel: CancellationToken,
    conn: Arc<dyn HttpExchange>,
    listener: Arc<dyn ExchangeListener<S>>,
}

impl<S> std::fmt::Debug for Exchange<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("state", &self.state.load())
            .field("time_left_ns", &self.time_left())
            .finish()
    }
}

impl<S> Exchange<S> {
    /// Create a running exchange.
    ///
    /// The deadline clock starts at `conn.request_start()`, not now, so time
    /// spent before admission counts against `timeout`.
    pub fn new(
        id: u64,
        request: Vec<u8>,
        response_capacity: usize,
        timeout: Duration,
        workflow_state: S,
        conn: Arc<dyn HttpExchange>,
        listener: Arc<dyn ExchangeListener<S>>,
    ) -> Result<Self, ExchangeError> {
        if timeout.is_zero() {
            return Err(ExchangeError::InvalidTimeout);
        }
        if response_capacity == 0 {
            return Err(ExchangeError::InvalidCapacity);
        }
        Ok(Self {
            id,
            created_at: Utc::now(),
            request_start: conn.request_start(),
            timeout,
            uri: conn.uri(),
            request,
            response: Mutex::new(ResponseBuffer::with_capacity(response_capacity)),
            state: AtomicProcessState::new(),
            cause: Mutex::new(None),
            dispatched: AtomicBool::new(false),
            on_terminal: Mutex::new(None),
            workflow_state: Mutex::new(workflow_state),
            cancel: CancellationToken::new(),
            conn,
            listener,
        })
    }

    /// Tie async steps of this exchange to `token` (usually a child of the
    /// engine's shutdown token).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.request_start.elapsed()
    }

    /// Nanoseconds until the deadline. Negative once expired.
    pub fn time_left(&self) -> i64 {
        let budget = i64::try_from(self.timeout.as_nanos()).unwrap_or(i64::MAX);
        let spent = i64::try_from(self.request_start.elapsed().as_nanos()).unwrap_or(i64::MAX);
        budget.saturating_sub(spent)
    }

    /// Remaining budget, or `None` if the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.time_left();
        (left > 0).then(|| Duration::from_nanos(left as u64))
    }

    pub fn is_expired(&self) -> bool {
        self.time_left() <= 0
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn response(&self) -> MutexGuard<'_, ResponseBuffer> {
        self.response.lock()
    }

    /// Append to the response body.
    pub fn write(&self, bytes: &[u8]) -> Result<(), HandlerError> {
        self.response.lock().write(bytes)
    }

    pub fn workflow_state(&self) -> MutexGuard<'_, S> {
        self.workflow_state.lock()
    }

    pub fn connection(&self) -> &dyn HttpExchange {
        self.conn.as_ref()
    }

    pub fn query_parameter(&self, name: &str) -> Option<String> {
        self.conn.query_parameter(name)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the exchange is terminal or its async work was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.is_terminal()
    }

    pub fn process_state(&self) -> ProcessState {
        self.state.load()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.load().is_terminal()
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Failure recorded with the terminal state, rendered as text.
    pub fn failure(&self) -> Option<String> {
        self.cause.lock().as_ref().map(ToString::to_string)
    }

    pub fn complete_with_done(&self) -> bool {
        self.complete(ProcessState::Done, None)
    }

    pub fn complete_with_timeout(&self) -> bool {
        self.complete(ProcessState::Timeout, None)
    }

    pub fn complete_with_interrupted(&self) -> bool {
        self.complete(ProcessState::Interrupted, None)
    }

    pub fn complete_with_rejected(&self) -> bool {
        self.complete(ProcessState::Rejected, None)
    }

    pub fn complete_with_request_overflow(&self) -> bool {
        self.complete(ProcessState::RequestBufferOverflow, None)
    }

    pub fn complete_with_response_overflow(&self) -> bool {
        self.complete(ProcessState::ResponseBufferOverflow, None)
    }

    pub fn complete_with_connection_closed(&self) -> bool {
        self.complete(ProcessState::ConnectionClosed, None)
    }

    /// Complete with the terminal state `cause` maps to.
    pub fn complete_with_fail(&self, cause: HandlerError) -> bool {
        let state = cause.terminal_state();
        self.complete(state, Some(cause))
    }

    /// Record `state` if the exchange is still running. Returns true if this
    /// call made the transition.
    fn complete(&self, state: ProcessState, cause: Option<HandlerError>) -> bool {
        // Cause is published under the same lock the CAS runs in, so a
        // dispatcher that sees the terminal state also sees the cause.
        let mut slot = self.cause.lock();
        if !self.state.finish(state) {
            return false;
        }
        *slot = cause;
        drop(slot);
        // Async steps still in flight stop waiting on external work.
        self.cancel.cancel();
        tracing::debug!(exchange_id = self.id, state = %state, "exchange completed");
        true
    }

    /// Install the callback that runs after dispatch. Only one may be
    /// registered per exchange.
    pub fn register_on_terminal(&self, callback: TerminalCallback<S>) -> Result<(), ExchangeError> {
        let mut slot = self.on_terminal.lock();
        if slot.is_some() {
            return Err(ExchangeError::CallbackAlreadyRegistered(self.id));
        }
        *slot = Some(callback);
        Ok(())
    }

    /// Hand the terminal exchange to the listener.
    ///
    /// Safe to call from any number of threads; the listener and the
    /// on-terminal callback run only for the first caller after a terminal
    /// state is recorded. Returns true for that caller.
    pub fn dispatch_terminal(&self) -> bool {
        let state = self.state.load();
        if !state.is_terminal() {
            return false;
        }
        if self
            .dispatched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let routed = catch_unwind(AssertUnwindSafe(|| {
            listener::dispatch(self.listener.as_ref(), self, state)
        }));
        match routed {
            Ok(Some(reply)) => reply.write_to(self.conn.as_ref()),
            Ok(None) => self.conn.close_connection(),
            Err(_) => {
                tracing::error!(exchange_id = self.id, state = %state, "listener panicked");
                self.conn.end_exchange_no_body(500);
            }
        }

        let callback = self.on_terminal.lock().take();
        if let Some(callback) = callback {
            callback(self);
        }
        true
    }
}

#[cfg(test)]
#[path = "exchange_tests.rs"]
mod tests;
