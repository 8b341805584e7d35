//! Graceful shutdown coordination.
//!
//! A state machine that stops admission and waits for in-flight exchanges
//! to reach dispatch before the engine tears down its threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

struct Inner {
    state: ShutdownState,
    in_flight: u32,
}

struct Shared {
    inner: Mutex<Inner>,
    drained: Condvar,
}

/// Coordinates graceful shutdown across engine components.
pub struct ShutdownCoordinator {
    shared: Arc<Shared>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner { state: ShutdownState::Running, in_flight: 0 }),
                drained: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.shared.inner.lock().state
    }

    /// Check if accepting new exchanges.
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Track an in-flight exchange. Returns None if shutting down.
    pub fn track(&self) -> Option<ShutdownGuard> {
        let mut inner = self.shared.inner.lock();
        if inner.state != ShutdownState::Running {
            return None;
        }
        inner.in_flight += 1;
        Some(ShutdownGuard { shared: Arc::clone(&self.shared) })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.shared.inner.lock().in_flight
    }

    /// Stop accepting, then wait up to `timeout` for tracked work to drain.
    pub fn initiate(&self, timeout: Duration) -> ShutdownResult {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        if inner.state == ShutdownState::Running {
            inner.state = ShutdownState::Draining;
            tracing::info!(in_flight = inner.in_flight, "draining");
        }

        while inner.in_flight > 0 {
            if self.shared.drained.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }

        inner.state = ShutdownState::Stopped;
        match inner.in_flight {
            0 => ShutdownResult::Complete,
            remaining => ShutdownResult::Timeout { remaining },
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for in-flight exchange tracking.
pub struct ShutdownGuard {
    shared: Arc<Shared>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 {
            self.shared.drained.notify_all();
        }
    }
}
