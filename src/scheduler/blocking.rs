//! Dedicated thread pool for blocking steps.
//!
//! Sized independently of the worker pool so that slow synchronous I/O never
//! occupies a worker thread. Submission never blocks: a full queue is an
//! immediate error.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// A job to run on the blocking pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for the blocking pool.
#[derive(Debug, Clone)]
pub struct BlockingPoolConfig {
    /// Number of threads. Must be non-zero to build a pool.
    pub threads: usize,
    /// Jobs allowed to wait for a free thread.
    pub queue_size: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
    /// Thread stack size in bytes (0 = platform default).
    pub stack_size: usize,
}

impl Default for BlockingPoolConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            queue_size: 256,
            thread_name_prefix: "pnio-blocking".to_string(),
            stack_size: 0,
        }
    }
}

/// Counters for pool activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BlockingPoolStats {
    pub jobs_executed: u64,
    pub jobs_panicked: u64,
    pub queue_overflows: u64,
    pub threads_active: usize,
    pub queued: usize,
}

struct Shared {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
    executed: AtomicU64,
    panicked: AtomicU64,
    overflows: AtomicU64,
    active: AtomicUsize,
}

/// Fixed-size pool draining one bounded job queue.
pub struct BlockingPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    queue_size: usize,
    threads: usize,
}

impl BlockingPool {
    pub fn new(config: BlockingPoolConfig) -> Result<Self, BlockingPoolError> {
        if config.threads == 0 {
            return Err(BlockingPoolError::NoThreads);
        }
        let shared = Arc::new(Shared {
            jobs: Mutex::new(VecDeque::with_capacity(config.queue_size)),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(config.threads);
        for id in 0..config.threads {
            let shared = shared.clone();
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, id));
            if config.stack_size > 0 {
                builder = builder.stack_size(config.stack_size);
            }
            let handle = builder
                .spawn(move || Self::thread_loop(&shared))
                .map_err(|e| BlockingPoolError::ThreadSpawnFailed(e.to_string()))?;
            handles.push(handle);
        }

        tracing::debug!(threads = config.threads, queue_size = config.queue_size, "blocking pool started");
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
            queue_size: config.queue_size,
            threads: config.threads,
        })
    }

    /// Queue `job` for execution.
    pub fn submit(&self, job: Job) -> Result<(), BlockingPoolError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(BlockingPoolError::PoolShutdown);
        }
        {
            let mut jobs = self.shared.jobs.lock();
            // `shutdown` clears the queue under this lock after setting the flag.
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(BlockingPoolError::PoolShutdown);
            }
            if jobs.len() >= self.queue_size {
                self.shared.overflows.fetch_add(1, Ordering::Relaxed);
                return Err(BlockingPoolError::QueueFull);
            }
            jobs.push_back(job);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    fn thread_loop(shared: &Shared) {
        loop {
            let job = {
                let mut jobs = shared.jobs.lock();
                loop {
                    if shared.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(job) = jobs.pop_front() {
                        shared.active.fetch_add(1, Ordering::SeqCst);
                        break job;
                    }
                    shared.available.wait(&mut jobs);
                }
            };

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!("blocking job panicked");
            }
            shared.executed.fetch_add(1, Ordering::Relaxed);
            shared.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn stats(&self) -> BlockingPoolStats {
        BlockingPoolStats {
            jobs_executed: self.shared.executed.load(Ordering::Relaxed),
            jobs_panicked: self.shared.panicked.load(Ordering::Relaxed),
            queue_overflows: self.shared.overflows.load(Ordering::Relaxed),
            threads_active: self.shared.active.load(Ordering::SeqCst),
            queued: self.shared.jobs.lock().len(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs, discard queued ones and join the threads.
    /// Jobs already running are waited for.
    pub fn shutdown(&self) -> usize {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let discarded = {
            let mut jobs = self.shared.jobs.lock();
            let n = jobs.len();
            jobs.clear();
            n
        };
        self.shared.available.notify_all();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("blocking pool thread panicked");
            }
        }
        discarded
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Errors for blocking pool operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockingPoolError {
    #[error("blocking pool is shut down")]
    PoolShutdown,

    #[error("blocking pool queue is full")]
    QueueFull,

    #[error("blocking pool needs at least one thread")]
    NoThreads,

    #[error("failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),
}
