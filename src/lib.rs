//! PNIO core: a bounded-latency, backpressure-aware exchange engine.
//!
//! Sits between a network listener and application handlers. Every accepted
//! request becomes an [`Exchange`] that walks an ordered [`Workflow`] under a
//! hard deadline and reaches exactly one terminal state, which is reported
//! exactly once to an [`ExchangeListener`] that produces the response.
//!
//! # Execution model
//!
//! - **Admission**: round-robin over bounded work queues. Normal work is
//!   refused at capacity; important work is inserted at the head.
//! - **Workers**: a fixed thread pool drains the queues and checks each
//!   deadline before running a step.
//! - **Steps**: compute steps run inline, blocking steps are forked onto a
//!   separate pool while the worker keeps servicing its queue, and async
//!   steps run on the engine's tokio runtime and resume through the queue.
//!
//! Cancellation is cooperative. A timed-out exchange is answered at its
//! deadline; the step that overran keeps running until it returns.

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod introspection;
pub mod listener;
pub mod network;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod workflow;

pub use config::{EffectiveConfig, EngineConfig};
pub use engine::{Admission, Engine};
pub use error::{ConfigError, EngineError, ExchangeError, HandlerError, WorkflowError};
pub use exchange::{Exchange, ProcessState};
pub use listener::{ExchangeListener, NoContentListener, Reply, StatusCodeListener};
pub use network::{HttpExchange, LoopbackExchange, Response};
pub use workflow::{Step, StepKind, Workflow, WorkflowBuilder, WorkflowHandle};
