//! Admission: spread new tasks round-robin over the work queues.
//!
//! A refused task is completed as `Rejected` and dispatched on the calling
//! thread, so overload costs one listener call and never blocks the caller.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::queue::{PushError, WorkQueue};
use super::task::Task;

/// Round-robin front door of the worker pool.
pub struct AdmissionController<S> {
    queues: Vec<Arc<WorkQueue<Task<S>>>>,
    next: AtomicUsize,
    rejected: AtomicU64,
}

impl<S: Send + 'static> AdmissionController<S> {
    /// `queue_count` queues, each bounded at `capacity` normal items.
    pub fn new(queue_count: usize, capacity: usize, important_capacity: Option<usize>) -> Self {
        let queues = (0..queue_count.max(1))
            .map(|_| Arc::new(WorkQueue::new(capacity, important_capacity)))
            .collect();
        Self { queues, next: AtomicUsize::new(0), rejected: AtomicU64::new(0) }
    }

    /// Place `task` on the next queue in rotation. Important tasks bypass the
    /// capacity check. Returns false if the task was refused, in which case
    /// it has already been completed and dispatched.
    pub fn submit(&self, task: Task<S>, important: bool) -> bool {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let queue = &self.queues[index];
        let pushed = if important { queue.push_important(task) } else { queue.push_normal(task) };

        match pushed {
            Ok(()) => true,
            Err(PushError::Closed(task)) => {
                tracing::debug!(exchange_id = task.exchange().id(), "admission after shutdown");
                task.interrupt();
                false
            }
            Err(refused) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(queue = index, reason = %refused, "task rejected");
                refused.into_inner().reject();
                false
            }
        }
    }

    pub fn queues(&self) -> &[Arc<WorkQueue<Task<S>>>] {
        &self.queues
    }

    pub fn queue(&self, index: usize) -> Option<&Arc<WorkQueue<Task<S>>>> {
        self.queues.get(index)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Current length of each queue, in index order.
    pub fn queue_depths(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.len()).collect()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn close_all(&self) {
        self.queues.iter().for_each(|q| q.close());
    }

    /// Take every task still queued, across all queues.
    pub fn drain_all(&self) -> Vec<Task<S>> {
        self.queues.iter().flat_map(|q| q.drain()).collect()
    }
}
