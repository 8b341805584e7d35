//! Worker threads: dequeue tasks and run them to their next fork point.
//!
//! Worker `i` drains queue `i % queue_count`. While joining a blocking step a
//! worker keeps servicing that same queue, so queued work makes progress even
//! when every worker is waiting on forked operations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::blocking::BlockingPool;
use super::queue::WorkQueue;
use super::task::Task;
use crate::error::EngineError;

/// Shared, read-only execution resources.
#[derive(Clone)]
pub struct ExecContext {
    pub blocking: Option<Arc<BlockingPool>>,
    pub runtime: Handle,
    /// How many tasks a joining worker may nest before it parks instead.
    pub max_join_depth: usize,
}

/// Per-thread worker state.
pub struct WorkerLocal<S> {
    pub id: usize,
    pub queue: Arc<WorkQueue<Task<S>>>,
    pub depth: usize,
}

/// Pool-wide counters, readable while the pool runs.
#[derive(Debug, Default)]
struct Counters {
    executed: AtomicU64,
}

/// Fixed set of worker threads bound to the admission queues.
pub struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    threads: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers. Returns once every thread is started.
    pub fn spawn<S: Send + 'static>(
        threads: usize,
        name_prefix: &str,
        stack_size: usize,
        queues: &[Arc<WorkQueue<Task<S>>>],
        ctx: ExecContext,
    ) -> Result<Self, EngineError> {
        if queues.is_empty() {
            return Err(EngineError::ThreadSpawnFailed("no queues to service".into()));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let mut handles = Vec::with_capacity(threads);

        for id in 0..threads {
            let queue = Arc::clone(&queues[id % queues.len()]);
            let ctx = ctx.clone();
            let stop = Arc::clone(&stop);
            let counters = Arc::clone(&counters);
            let mut builder = thread::Builder::new().name(format!("{name_prefix}-{id}"));
            if stack_size > 0 {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || {
                    let mut local = WorkerLocal { id, queue, depth: 0 };
                    worker_loop(&ctx, &mut local, &stop, &counters);
                })
                .map_err(|e| EngineError::ThreadSpawnFailed(e.to_string()))?;
            handles.push(handle);
        }

        tracing::debug!(threads, queues = queues.len(), "worker pool started");
        Ok(Self { handles: Mutex::new(handles), stop, counters, threads })
    }

    pub fn num_threads(&self) -> usize {
        self.threads
    }

    /// Tasks dequeued by the worker loops. Work run while joining is not counted.
    pub fn tasks_executed(&self) -> u64 {
        self.counters.executed.load(Ordering::Relaxed)
    }

    /// Ask workers to exit after their current task. Callers close the
    /// queues to release idle workers.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for every worker to exit.
    pub fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop<S: Send + 'static>(
    ctx: &ExecContext,
    local: &mut WorkerLocal<S>,
    stop: &AtomicBool,
    counters: &Counters,
) {
    tracing::trace!(worker = local.id, "worker running");
    while !stop.load(Ordering::SeqCst) {
        let Some(task) = local.queue.pop() else {
            break;
        };
        counters.executed.fetch_add(1, Ordering::Relaxed);
        task.execute(ctx, local);
    }
    tracing::trace!(worker = local.id, "worker exiting");
}
