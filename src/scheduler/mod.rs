//! Task scheduling for the exchange engine.
//!
//! Admission spreads tasks over bounded work queues, worker threads drain
//! them, and blocking steps are forked onto a separate pool.

mod admission;
mod blocking;
mod queue;
mod task;
mod worker;

pub use admission::AdmissionController;
pub use blocking::{BlockingPool, BlockingPoolConfig, BlockingPoolError, BlockingPoolStats, Job};
pub use queue::{PushError, WorkQueue};
pub use task::{Task, TaskCell, TaskState};
pub use worker::{ExecContext, WorkerLocal, WorkerPool};
