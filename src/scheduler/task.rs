//! Task execution: one exchange walking its workflow snapshot.
//!
//! Every step kind races the same deadline:
//! - compute steps run inline and are checked against the deadline after
//!   they return;
//! - blocking steps are forked onto the blocking pool while the worker joins
//!   cooperatively, running other work from its own queue;
//! - async steps are spawned on the engine runtime under a timeout. The
//!   worker returns at once and the completion callback either finishes the
//!   exchange or pushes the continuation back onto the origin queue.
//!
//! Stopping to wait never stops the operation itself. A timed-out blocking
//! or compute step keeps running until it returns.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Condvar, Mutex};

use super::blocking::{BlockingPoolError, Job};
use super::queue::WorkQueue;
use super::worker::{ExecContext, WorkerLocal};
use crate::error::HandlerError;
use crate::exchange::Exchange;
use crate::telemetry::ExchangeSpan;
use crate::workflow::{AsyncHandler, StepKind, SyncHandler, Workflow};

/// Upper bound on a single cooperative wait while joining, so the joiner
/// notices terminal states written by other threads.
const JOIN_SLICE: Duration = Duration::from_millis(25);

/// Lifecycle of a forked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Init = 0,
    Forked = 1,
    Completed = 2,
}

impl From<u8> for TaskState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Forked,
            _ => Self::Completed,
        }
    }
}

/// Completion record shared between the forking worker and whatever thread
/// finishes the forked operation.
pub struct TaskCell {
    state: AtomicU8,
    outcome: Mutex<Option<Result<(), HandlerError>>>,
    done: Condvar,
}

impl TaskCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskState::Init as u8),
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// `Init → Forked`.
    pub fn fork(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Init as u8,
                TaskState::Forked as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Record the outcome. Only the first caller wins.
    pub fn complete(&self, outcome: Result<(), HandlerError>) -> bool {
        let mut slot = self.outcome.lock();
        let won = self
            .state
            .compare_exchange(
                TaskState::Forked as u8,
                TaskState::Completed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .or_else(|_| {
                self.state.compare_exchange(
                    TaskState::Init as u8,
                    TaskState::Completed as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            })
            .is_ok();
        if won {
            *slot = Some(outcome);
            self.done.notify_all();
        }
        won
    }

    /// Take the outcome once completed.
    pub fn take(&self) -> Option<Result<(), HandlerError>> {
        if !self.is_completed() {
            return None;
        }
        Some(self.outcome.lock().take().unwrap_or(Ok(())))
    }

    /// Park until completion or `timeout`.
    pub fn wait(&self, timeout: Duration) {
        let mut slot = self.outcome.lock();
        if self.is_completed() {
            return;
        }
        self.done.wait_for(&mut slot, timeout);
    }
}

impl Default for TaskCell {
    fn default() -> Self {
        Self::new()
    }
}

/// How a cooperative join ended.
enum Joined {
    Finished(Result<(), HandlerError>),
    Expired,
    /// Another path already made the exchange terminal.
    Abandoned,
}

/// An exchange bound to the workflow snapshot it started on and its cursor.
pub struct Task<S> {
    exchange: Arc<Exchange<S>>,
    workflow: Workflow<S>,
    cursor: usize,
}

impl<S> fmt::Debug for Task<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("exchange", &self.exchange.id())
            .field("cursor", &self.cursor)
            .field("steps", &self.workflow.len())
            .finish()
    }
}

impl<S: Send + 'static> Task<S> {
    pub fn new(exchange: Arc<Exchange<S>>, workflow: Workflow<S>) -> Self {
        Self { exchange, workflow, cursor: 0 }
    }

    pub fn exchange(&self) -> &Arc<Exchange<S>> {
        &self.exchange
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Complete and dispatch with `Rejected` (admission refused the task).
    pub fn reject(self) {
        self.exchange.complete_with_rejected();
        self.exchange.dispatch_terminal();
    }

    /// Complete and dispatch with `Interrupted` (engine stopped first).
    pub fn interrupt(self) {
        self.exchange.complete_with_interrupted();
        self.exchange.dispatch_terminal();
    }

    /// Entry point used by workers for every dequeued task.
    pub(crate) fn execute(self, ctx: &ExecContext, local: &mut WorkerLocal<S>) {
        let exchange = Arc::clone(&self.exchange);
        if exchange.is_terminal() {
            exchange.dispatch_terminal();
            return;
        }
        if exchange.is_expired() {
            tracing::debug!(exchange_id = exchange.id(), "deadline passed while queued");
            exchange.complete_with_timeout();
            exchange.dispatch_terminal();
            return;
        }

        let span = ExchangeSpan::new(exchange.id(), exchange.uri(), self.cursor);
        let _entered = span.enter();
        self.run(ctx, local);
        span.record("state", exchange.process_state().as_str());
    }

    fn run(mut self, ctx: &ExecContext, local: &mut WorkerLocal<S>) {
        let exchange = Arc::clone(&self.exchange);
        while let Some(step) = self.workflow.get(self.cursor) {
            if exchange.is_terminal() {
                exchange.dispatch_terminal();
                return;
            }
            if exchange.is_expired() {
                exchange.complete_with_timeout();
                exchange.dispatch_terminal();
                return;
            }

            tracing::trace!(
                exchange_id = exchange.id(),
                step = step.description(),
                kind = step.kind().name(),
                "running step"
            );
            let outcome = match step.kind().clone() {
                StepKind::Compute(handler) => run_guarded(&handler, &exchange),
                StepKind::Blocking(handler) => {
                    match fork_blocking(handler, &exchange, ctx, local) {
                        Joined::Finished(result) => result,
                        Joined::Expired => Err(HandlerError::Timeout),
                        Joined::Abandoned => {
                            exchange.dispatch_terminal();
                            return;
                        }
                    }
                }
                StepKind::Async(handler) => {
                    self.cursor += 1;
                    self.fork_async(handler, ctx, local);
                    return;
                }
            };

            if let Err(cause) = outcome {
                exchange.complete_with_fail(cause);
                exchange.dispatch_terminal();
                return;
            }
            self.cursor += 1;
        }
        finish(&exchange);
    }

    /// Spawn the async step and return without waiting for it.
    fn fork_async(self, handler: AsyncHandler<S>, ctx: &ExecContext, local: &WorkerLocal<S>) {
        let exchange = Arc::clone(&self.exchange);
        let Some(budget) = exchange.remaining() else {
            exchange.complete_with_timeout();
            exchange.dispatch_terminal();
            return;
        };

        let future = match catch_unwind(AssertUnwindSafe(|| handler(Arc::clone(&exchange)))) {
            Ok(future) => future,
            Err(_) => {
                exchange.complete_with_fail(HandlerError::failed("async step panicked"));
                exchange.dispatch_terminal();
                return;
            }
        };

        let cell = Arc::new(TaskCell::new());
        cell.fork();
        let cancel = exchange.cancellation().clone();
        let origin = Arc::clone(&local.queue);

        ctx.runtime.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(HandlerError::Interrupted),
                raced = tokio::time::timeout(budget, AssertUnwindSafe(future).catch_unwind()) => {
                    match raced {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(HandlerError::failed("async step panicked")),
                        Err(_) => Err(HandlerError::Timeout),
                    }
                }
            };
            if cell.complete(outcome) {
                if let Some(outcome) = cell.take() {
                    self.resume(outcome, &origin);
                }
            }
        });
    }

    /// Continue after an async step, from the thread that completed it.
    fn resume(self, outcome: Result<(), HandlerError>, origin: &WorkQueue<Task<S>>) {
        let exchange = Arc::clone(&self.exchange);
        match outcome {
            Err(cause) => {
                exchange.complete_with_fail(cause);
                exchange.dispatch_terminal();
            }
            Ok(()) if exchange.is_terminal() => {
                exchange.dispatch_terminal();
            }
            Ok(()) if self.cursor >= self.workflow.len() => finish(&exchange),
            Ok(()) => {
                if let Err(refused) = origin.push_continuation(self) {
                    refused.into_inner().interrupt();
                }
            }
        }
    }
}

/// Record the final outcome once every step has returned.
fn finish<S>(exchange: &Exchange<S>) {
    if exchange.is_expired() {
        exchange.complete_with_timeout();
    } else {
        exchange.complete_with_done();
    }
    exchange.dispatch_terminal();
}

/// Run a synchronous handler, turning panics into failures.
fn run_guarded<S>(handler: &SyncHandler<S>, exchange: &Exchange<S>) -> Result<(), HandlerError> {
    match catch_unwind(AssertUnwindSafe(|| handler(exchange))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "step panicked".to_string());
            Err(HandlerError::Failed(msg))
        }
    }
}

fn fork_blocking<S: Send + 'static>(
    handler: SyncHandler<S>,
    exchange: &Arc<Exchange<S>>,
    ctx: &ExecContext,
    local: &mut WorkerLocal<S>,
) -> Joined {
    let Some(pool) = ctx.blocking.as_ref() else {
        return Joined::Finished(Err(HandlerError::failed("no blocking pool configured")));
    };

    let cell = Arc::new(TaskCell::new());
    cell.fork();
    let job_cell = Arc::clone(&cell);
    let job_exchange = Arc::clone(exchange);
    let waker = Arc::clone(&local.queue);
    let job: Job = Box::new(move || {
        let result = run_guarded(&handler, &job_exchange);
        if job_cell.complete(result) {
            waker.wake();
        }
    });

    match pool.submit(job) {
        Ok(()) => join(&cell, exchange, ctx, local),
        Err(BlockingPoolError::PoolShutdown) => Joined::Finished(Err(HandlerError::Interrupted)),
        Err(e) => Joined::Finished(Err(HandlerError::Rejected(e.to_string()))),
    }
}

/// Wait for `cell` without idling: keep running tasks from the local queue
/// until the forked operation completes or the deadline passes.
fn join<S: Send + 'static>(
    cell: &TaskCell,
    exchange: &Exchange<S>,
    ctx: &ExecContext,
    local: &mut WorkerLocal<S>,
) -> Joined {
    loop {
        if let Some(result) = cell.take() {
            return Joined::Finished(result);
        }
        if exchange.is_terminal() {
            return Joined::Abandoned;
        }
        let Some(left) = exchange.remaining() else {
            return Joined::Expired;
        };
        let slice = left.min(JOIN_SLICE);

        if local.depth < ctx.max_join_depth {
            let queue = Arc::clone(&local.queue);
            match queue.pop_timeout_unless(slice, || cell.is_completed()) {
                Some(other) => {
                    local.depth += 1;
                    other.execute(ctx, local);
                    local.depth -= 1;
                }
                // A closed queue returns at once; park instead of spinning.
                None if queue.is_closed() => cell.wait(slice),
                None => {}
            }
        } else {
            cell.wait(slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cell_walks_init_forked_completed() {
        let cell = TaskCell::new();
        assert_eq!(cell.state(), TaskState::Init);
        assert!(cell.fork());
        assert!(!cell.fork());
        assert_eq!(cell.state(), TaskState::Forked);
        assert!(cell.take().is_none());
        assert!(cell.complete(Ok(())));
        assert_eq!(cell.state(), TaskState::Completed);
        assert!(matches!(cell.take(), Some(Ok(()))));
    }

    #[test]
    fn cell_completion_is_single_writer() {
        let cell = TaskCell::new();
        cell.fork();
        assert!(cell.complete(Err(HandlerError::Timeout)));
        assert!(!cell.complete(Ok(())));
        assert!(matches!(cell.take(), Some(Err(HandlerError::Timeout))));
    }

    #[test]
    fn cell_wait_returns_on_completion() {
        let cell = Arc::new(TaskCell::new());
        cell.fork();
        let completer = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cell.complete(Ok(()))
            })
        };
        while !cell.is_completed() {
            cell.wait(Duration::from_millis(50));
        }
        assert!(completer.join().unwrap());
    }

    #[test]
    fn run_guarded_converts_panics() {
        let handler: SyncHandler<()> = Arc::new(|_| panic!("kaboom"));
        let conn = Arc::new(crate::network::LoopbackExchange::new("/p", Vec::new()));
        let ex = Exchange::new(
            1,
            Vec::new(),
            16,
            Duration::from_secs(1),
            (),
            conn,
            Arc::new(crate::listener::StatusCodeListener::default()),
        )
        .unwrap();
        let err = run_guarded(&handler, &ex).unwrap_err();
        assert!(matches!(err, HandlerError::Failed(ref m) if m == "kaboom"));
    }

    fn exchange(timeout: Duration) -> Arc<Exchange<()>> {
        let conn = Arc::new(crate::network::LoopbackExchange::new("/join", Vec::new()));
        let ex = Exchange::new(
            2,
            Vec::new(),
            16,
            timeout,
            (),
            conn,
            Arc::new(crate::listener::StatusCodeListener::default()),
        )
        .unwrap();
        Arc::new(ex)
    }

    fn context(runtime: &tokio::runtime::Runtime) -> ExecContext {
        ExecContext { blocking: None, runtime: runtime.handle().clone(), max_join_depth: 8 }
    }

    #[test]
    fn join_on_closed_queue_parks_until_completion() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let ctx = context(&runtime);
        let queue: Arc<WorkQueue<Task<()>>> = Arc::new(WorkQueue::new(4, None));
        queue.close();
        let mut local = WorkerLocal { id: 0, queue, depth: 0 };

        let cell = Arc::new(TaskCell::new());
        cell.fork();
        let completer = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                cell.complete(Err(HandlerError::failed("disk")))
            })
        };

        let ex = exchange(Duration::from_secs(5));
        let joined = join(&cell, &ex, &ctx, &mut local);
        assert!(matches!(joined, Joined::Finished(Err(HandlerError::Failed(ref m))) if m == "disk"));
        assert!(completer.join().unwrap());
    }

    #[test]
    fn join_on_closed_queue_still_honours_deadline() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let ctx = context(&runtime);
        let queue: Arc<WorkQueue<Task<()>>> = Arc::new(WorkQueue::new(4, None));
        queue.close();
        let mut local = WorkerLocal { id: 0, queue, depth: 0 };

        let cell = TaskCell::new();
        cell.fork();
        let ex = exchange(Duration::from_millis(40));
        let started = std::time::Instant::now();
        assert!(matches!(join(&cell, &ex, &ctx, &mut local), Joined::Expired));
        assert!(started.elapsed() >= Duration::from_millis(35));
    }
}
