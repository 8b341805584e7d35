//! Bounded work queue with an important-traffic bypass.
//!
//! Normal pushes go to the tail and are refused at capacity. Important
//! pushes go to the head and skip the capacity check. Continuations of
//! already-admitted work also go to the head and are never refused while
//! the queue is open.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Why a push was refused. The rejected item is handed back.
#[derive(Debug)]
pub enum PushError<T> {
    Full(T),
    ImportantFull(T),
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::ImportantFull(t) | Self::Closed(t) => t,
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "work queue is full"),
            Self::ImportantFull(_) => write!(f, "important lane is full"),
            Self::Closed(_) => write!(f, "work queue is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Normal,
    Important,
    Continuation,
}

struct Entry<T> {
    lane: Lane,
    item: T,
}

struct Inner<T> {
    items: VecDeque<Entry<T>>,
    important: usize,
    closed: bool,
}

/// Mutex + condvar protected deque shared by admission and workers.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
    important_capacity: Option<usize>,
}

impl<T> WorkQueue<T> {
    /// Queue holding at most `capacity` items on the normal path. The
    /// important lane is unbounded when `important_capacity` is `None`.
    pub fn new(capacity: usize, important_capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                important: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
            important_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append at the tail if the current size is below capacity.
    pub fn push_normal(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PushError::Closed(item));
        }
        if inner.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        inner.items.push_back(Entry { lane: Lane::Normal, item });
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Insert at the head without checking the normal capacity.
    pub fn push_important(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PushError::Closed(item));
        }
        if let Some(limit) = self.important_capacity {
            if inner.important >= limit {
                return Err(PushError::ImportantFull(item));
            }
        }
        inner.important += 1;
        inner.items.push_front(Entry { lane: Lane::Important, item });
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Insert the continuation of admitted work at the head.
    pub fn push_continuation(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PushError::Closed(item));
        }
        inner.items.push_front(Entry { lane: Lane::Continuation, item });
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Block until an item is available. Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(item) = Self::take_front(&mut inner) {
                return Some(item);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Wait at most `timeout` for an item. May return early with `None`
    /// when [`wake`](Self::wake) is called.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.pop_timeout_unless(timeout, || false)
    }

    /// Like [`pop_timeout`](Self::pop_timeout), but skips waiting when `done`
    /// holds. `done` is evaluated under the queue lock, so a condition set
    /// before a [`wake`](Self::wake) is never missed.
    pub fn pop_timeout_unless<F>(&self, timeout: Duration, done: F) -> Option<T>
    where
        F: Fn() -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        if let Some(item) = Self::take_front(&mut inner) {
            return Some(item);
        }
        if done() {
            return None;
        }
        self.available.wait_for(&mut inner, timeout);
        if inner.closed {
            return None;
        }
        Self::take_front(&mut inner)
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        Self::take_front(&mut inner)
    }

    /// Wake every waiter without pushing anything.
    pub fn wake(&self) {
        let _guard = self.inner.lock();
        self.available.notify_all();
    }

    /// Refuse further pushes and release every blocked waiter.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove and return everything still queued, head first.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.important = 0;
        inner.items.drain(..).map(|e| e.item).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    fn take_front(inner: &mut Inner<T>) -> Option<T> {
        let entry = inner.items.pop_front()?;
        if entry.lane == Lane::Important {
            inner.important -= 1;
        }
        Some(entry.item)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
