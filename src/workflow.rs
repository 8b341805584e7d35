//! Ordered handler pipelines.
//!
//! A [`Workflow`] is an immutable slice of steps shared by reference. Swapping
//! the workflow behind a [`WorkflowHandle`] never disturbs exchanges already
//! walking an older snapshot.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::error::{HandlerError, WorkflowError};
use crate::exchange::Exchange;

/// Synchronous step body, used by compute and blocking steps.
pub type SyncHandler<S> = Arc<dyn Fn(&Exchange<S>) -> Result<(), HandlerError> + Send + Sync>;

/// Step body that returns a future.
pub type AsyncHandler<S> =
    Arc<dyn Fn(Arc<Exchange<S>>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Execution discipline of a step.
pub enum StepKind<S> {
    /// Runs inline on the worker thread.
    Compute(SyncHandler<S>),
    /// Runs on the blocking pool while the worker keeps servicing its queue.
    Blocking(SyncHandler<S>),
    /// Returns a future driven by the engine's async runtime.
    Async(AsyncHandler<S>),
}

impl<S> Clone for StepKind<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Compute(h) => Self::Compute(Arc::clone(h)),
            Self::Blocking(h) => Self::Blocking(Arc::clone(h)),
            Self::Async(h) => Self::Async(Arc::clone(h)),
        }
    }
}

impl<S> StepKind<S> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Compute(_) => "compute",
            Self::Blocking(_) => "blocking",
            Self::Async(_) => "async",
        }
    }
}

/// One handler in a workflow.
pub struct Step<S> {
    description: String,
    kind: StepKind<S>,
}

impl<S> Clone for Step<S> {
    fn clone(&self) -> Self {
        Self { description: self.description.clone(), kind: self.kind.clone() }
    }
}

impl<S> fmt::Debug for Step<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.name(), self.description)
    }
}

impl<S> Step<S> {
    pub fn compute<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Exchange<S>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self { description: description.into(), kind: StepKind::Compute(Arc::new(f)) }
    }

    pub fn blocking<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Exchange<S>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self { description: description.into(), kind: StepKind::Blocking(Arc::new(f)) }
    }

    pub fn future<F, Fut>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<Exchange<S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: AsyncHandler<S> = Arc::new(move |ex| f(ex).boxed());
        Self { description: description.into(), kind: StepKind::Async(handler) }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> &StepKind<S> {
        &self.kind
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, StepKind::Blocking(_))
    }
}

/// Immutable view over a contiguous run of steps.
pub struct Workflow<S> {
    steps: Arc<[Step<S>]>,
    start: usize,
}

impl<S> Clone for Workflow<S> {
    fn clone(&self) -> Self {
        Self { steps: Arc::clone(&self.steps), start: self.start }
    }
}

impl<S> fmt::Debug for Workflow<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<S> Default for Workflow<S> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<S> Workflow<S> {
    pub fn builder(first: Step<S>) -> WorkflowBuilder<S> {
        WorkflowBuilder { steps: vec![first] }
    }

    pub fn empty() -> Self {
        Self { steps: Arc::from(Vec::new()), start: 0 }
    }

    pub fn len(&self) -> usize {
        self.steps.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&Step<S>> {
        self.steps.get(self.start + index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step<S>> {
        self.steps[self.start..].iter()
    }

    /// Suffix starting at the first step matching `pred`, or an empty
    /// workflow if none match. Shares storage with `self`.
    pub fn skip_before<P>(&self, pred: P) -> Self
    where
        P: Fn(&Step<S>) -> bool,
    {
        match self.iter().position(pred) {
            Some(offset) => Self { steps: Arc::clone(&self.steps), start: self.start + offset },
            None => Self::empty(),
        }
    }

    pub fn for_each<F>(&self, visitor: F)
    where
        F: FnMut(&Step<S>),
    {
        self.iter().for_each(visitor);
    }

    pub fn map<T, F>(&self, f: F) -> Vec<T>
    where
        F: FnMut(&Step<S>) -> T,
    {
        self.iter().map(f).collect()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.map(|s| s.description().to_owned())
    }

    /// Reject blocking steps when there is no blocking pool to run them.
    pub fn validate(&self, blocking_pool_size: usize) -> Result<(), WorkflowError> {
        if blocking_pool_size > 0 {
            return Ok(());
        }
        match self.iter().find(|s| s.is_blocking()) {
            Some(step) => Err(WorkflowError::BlockingStepWithoutPool {
                step: step.description().to_owned(),
            }),
            None => Ok(()),
        }
    }
}

/// Appends steps in order, then freezes them into a [`Workflow`].
pub struct WorkflowBuilder<S> {
    steps: Vec<Step<S>>,
}

impl<S> WorkflowBuilder<S> {
    pub fn next(mut self, step: Step<S>) -> Self {
        self.steps.push(step);
        self
    }

    /// Expand `items` into one step each.
    pub fn next_all<I, F>(mut self, items: I, mapper: F) -> Self
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Step<S>,
    {
        self.steps.extend(items.into_iter().map(mapper));
        self
    }

    /// Expand `items`, then append one compute step that post-processes
    /// their combined effect.
    pub fn next_all_then<I, F, P>(
        self,
        items: I,
        mapper: F,
        description: impl Into<String>,
        post: P,
    ) -> Self
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Step<S>,
        P: Fn(&Exchange<S>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.next_all(items, mapper).next(Step::compute(description, post))
    }

    pub fn build(self) -> Workflow<S> {
        Workflow { steps: Arc::from(self.steps), start: 0 }
    }
}

/// Atomically swappable root of a workflow.
pub struct WorkflowHandle<S> {
    current: RwLock<Workflow<S>>,
}

impl<S> WorkflowHandle<S> {
    pub fn new(workflow: Workflow<S>) -> Self {
        Self { current: RwLock::new(workflow) }
    }

    /// Workflow new exchanges should start on.
    pub fn snapshot(&self) -> Workflow<S> {
        self.current.read().clone()
    }

    /// Replace the root, returning the previous workflow.
    pub fn update(&self, workflow: Workflow<S>) -> Workflow<S> {
        std::mem::replace(&mut *self.current.write(), workflow)
    }
}
