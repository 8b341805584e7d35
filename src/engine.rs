//! The exchange engine: admission, workers, pools and bookkeeping for one
//! endpoint (or a set of endpoints sharing a workflow state type).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::{Exchange, LiveRegistry, ProcessState};
use crate::introspection::{self, ExchangeSnapshot};
use crate::listener::ExchangeListener;
use crate::network::HttpExchange;
use crate::scheduler::{
    AdmissionController, BlockingPool, BlockingPoolConfig, BlockingPoolStats, ExecContext, Task,
    WorkerPool,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownResult};
use crate::telemetry::{EngineCounters, EngineStats, FacadeSink, MetricsSink, EXCHANGE_LATENCY_MS};
use crate::workflow::{Step, Workflow, WorkflowHandle};

/// What happened to an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued for a worker.
    Queued { id: u64 },
    /// Finished and dispatched without reaching a workflow step.
    Refused { id: u64, state: ProcessState },
}

impl Admission {
    pub fn id(&self) -> u64 {
        match self {
            Self::Queued { id } | Self::Refused { id, .. } => *id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// Bounded-latency exchange engine.
///
/// Every accepted exchange reaches exactly one terminal state and is
/// dispatched to the listener exactly once, including exchanges still live
/// when the engine shuts down.
pub struct Engine<S: Send + 'static> {
    config: EngineConfig,
    workflow: WorkflowHandle<S>,
    listener: Arc<dyn ExchangeListener<S>>,
    admission: Arc<AdmissionController<S>>,
    workers: WorkerPool,
    blocking: Option<Arc<BlockingPool>>,
    runtime: Mutex<Option<Runtime>>,
    registry: LiveRegistry<S>,
    counters: Arc<EngineCounters>,
    sink: Arc<dyn MetricsSink>,
    shutdown: ShutdownCoordinator,
    cancel: CancellationToken,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl<S: Send + 'static> Engine<S> {
    /// Build an engine reporting to the `metrics` facade.
    pub fn new(
        config: EngineConfig,
        workflow: Workflow<S>,
        listener: Arc<dyn ExchangeListener<S>>,
    ) -> Result<Self, EngineError> {
        Self::with_metrics(config, workflow, listener, Arc::new(FacadeSink))
    }

    pub fn with_metrics(
        config: EngineConfig,
        workflow: Workflow<S>,
        listener: Arc<dyn ExchangeListener<S>>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        workflow.validate(config.blocking_pool_size)?;

        let prefix = config.thread_name_prefix.clone();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.async_threads)
            .thread_name(format!("{prefix}-async"))
            .enable_time()
            .build()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;

        let blocking = if config.blocking_pool_size > 0 {
            let pool = BlockingPool::new(BlockingPoolConfig {
                threads: config.blocking_pool_size,
                queue_size: config.blocking_queue_size,
                thread_name_prefix: format!("{prefix}-blocking"),
                stack_size: 0,
            })
            .map_err(|e| EngineError::ThreadSpawnFailed(e.to_string()))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let admission = Arc::new(AdmissionController::new(
            config.queue_count,
            config.queue_capacity,
            config.important_capacity,
        ));
        let ctx = ExecContext {
            blocking: blocking.clone(),
            runtime: runtime.handle().clone(),
            max_join_depth: config.max_join_depth,
        };
        let workers = WorkerPool::spawn(
            config.effective_worker_threads(),
            &prefix,
            0,
            admission.queues(),
            ctx,
        )?;

        let registry = LiveRegistry::new();
        let cancel = CancellationToken::new();
        if let Some(every) = config.sweep_interval() {
            spawn_sweeper(&runtime, registry.clone(), every, cancel.clone());
        }

        tracing::info!(
            workers = workers.num_threads(),
            queues = config.queue_count,
            queue_capacity = config.queue_capacity,
            blocking_pool = config.blocking_pool_size,
            timeout_ms = config.timeout_ms,
            steps = workflow.len(),
            "engine started"
        );

        Ok(Self {
            config,
            workflow: WorkflowHandle::new(workflow),
            listener,
            admission,
            workers,
            blocking,
            runtime: Mutex::new(Some(runtime)),
            registry,
            counters: Arc::new(EngineCounters::new()),
            sink,
            shutdown: ShutdownCoordinator::new(),
            cancel,
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        })
    }

    /// Admit one request arriving on `conn`.
    ///
    /// A body over `request_max_bytes` ends as `RequestBufferOverflow`, and a
    /// full queue as `Rejected`; both are dispatched before this returns.
    /// Fails with [`EngineError::Shutdown`] once shutdown has begun, in which
    /// case nothing is written to `conn`.
    pub fn accept(
        &self,
        conn: Arc<dyn HttpExchange>,
        state: S,
        important: bool,
    ) -> Result<Admission, EngineError> {
        let guard = self.shutdown.track().ok_or(EngineError::Shutdown)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.received(self.sink.as_ref());

        let (body, overflow) = match conn.receive_request_bytes(self.config.request_max_bytes) {
            Ok(body) => (body, None),
            Err(too_large) => (Vec::new(), Some(too_large)),
        };

        let exchange = Exchange::new(
            id,
            body,
            self.config.response_max_bytes,
            self.config.timeout(),
            state,
            conn,
            Arc::clone(&self.listener),
        )?
        .with_cancellation(self.cancel.child_token());
        let exchange = Arc::new(exchange);

        // The callback must be in place before the registry publishes the
        // exchange to the sweeper and to `connection_closed`.
        let registry = self.registry.clone();
        let counters = Arc::clone(&self.counters);
        let sink = Arc::clone(&self.sink);
        exchange.register_on_terminal(Box::new(move |ex: &Exchange<S>| {
            registry.remove(ex.id());
            counters.record(ex.process_state(), sink.as_ref());
            sink.histogram(EXCHANGE_LATENCY_MS, ex.elapsed().as_secs_f64() * 1000.0);
            counters.leave(sink.as_ref());
            drop(guard);
        }))?;
        self.counters.enter(self.sink.as_ref());
        self.registry.insert(Arc::clone(&exchange));

        if let Some(too_large) = overflow {
            tracing::debug!(exchange_id = id, limit = too_large.limit, "request body too large");
            exchange.complete_with_request_overflow();
            exchange.dispatch_terminal();
            return Ok(Admission::Refused { id, state: exchange.process_state() });
        }

        let task = Task::new(Arc::clone(&exchange), self.workflow.snapshot());
        if self.admission.submit(task, important) {
            Ok(Admission::Queued { id })
        } else {
            Ok(Admission::Refused { id, state: exchange.process_state() })
        }
    }

    /// The client behind exchange `id` went away. Returns false if the
    /// exchange is no longer live.
    pub fn connection_closed(&self, id: u64) -> bool {
        match self.registry.get(id) {
            Some(exchange) => {
                exchange.complete_with_connection_closed();
                exchange.dispatch_terminal();
                true
            }
            None => false,
        }
    }

    /// Swap the workflow new exchanges start on. In-flight exchanges keep
    /// the snapshot they started with. Returns the previous workflow.
    pub fn update_workflow(&self, workflow: Workflow<S>) -> Result<Workflow<S>, EngineError> {
        workflow.validate(self.config.blocking_pool_size)?;
        tracing::info!(steps = workflow.len(), "workflow updated");
        Ok(self.workflow.update(workflow))
    }

    pub fn workflow(&self) -> Workflow<S> {
        self.workflow.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &LiveRegistry<S> {
        &self.registry
    }

    /// Every exchange admitted but not yet dispatched, ordered by id.
    pub fn live_exchanges(&self) -> Vec<ExchangeSnapshot> {
        introspection::snapshot_all(&self.registry)
    }

    /// Compute step that renders [`live_exchanges`](Self::live_exchanges)
    /// into the response, for mounting on an introspection route.
    pub fn introspection_step(&self) -> Step<S> {
        introspection::introspection_step(self.registry.clone())
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    pub fn in_flight(&self) -> i64 {
        self.counters.in_flight()
    }

    pub fn queue_depths(&self) -> Vec<usize> {
        self.admission.queue_depths()
    }

    pub fn blocking_stats(&self) -> Option<BlockingPoolStats> {
        self.blocking.as_ref().map(|pool| pool.stats())
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_accepting()
    }

    /// Stop admission, wait up to `timeout` for in-flight exchanges, then
    /// interrupt whatever is left and stop every thread.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownResult {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return ShutdownResult::Complete;
        }
        tracing::info!(in_flight = self.in_flight(), "engine shutting down");
        let result = self.shutdown.initiate(timeout);
        if let ShutdownResult::Timeout { remaining } = result {
            tracing::warn!(remaining, "shutdown timed out, interrupting live exchanges");
        }

        self.cancel.cancel();
        for exchange in self.registry.exchanges() {
            exchange.complete_with_interrupted();
            exchange.dispatch_terminal();
        }

        self.workers.stop();
        self.admission.close_all();
        self.workers.join();
        for task in self.admission.drain_all() {
            task.interrupt();
        }

        if let Some(pool) = &self.blocking {
            let discarded = pool.shutdown();
            if discarded > 0 {
                tracing::debug!(discarded, "blocking jobs discarded");
            }
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        tracing::info!(stats = ?self.stats(), "engine stopped");
        result
    }
}

impl<S: Send + 'static> Drop for Engine<S> {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

/// Periodically time out expired exchanges, so a client gets its response
/// at the deadline even while a step keeps running.
fn spawn_sweeper<S: Send + 'static>(
    runtime: &Runtime,
    registry: LiveRegistry<S>,
    every: Duration,
    cancel: CancellationToken,
) {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => sweep_expired(&registry),
            }
        }
    });
}

fn sweep_expired<S>(registry: &LiveRegistry<S>) {
    for exchange in registry.exchanges() {
        if exchange.is_expired() && exchange.complete_with_timeout() {
            tracing::debug!(exchange_id = exchange.id(), "deadline sweep");
            exchange.dispatch_terminal();
        }
    }
}
