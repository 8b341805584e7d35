//! Registry of live exchanges, keyed by id.

use std::sync::Arc;

use dashmap::DashMap;

use super::Exchange;

/// Shared id → exchange map. Admission inserts, terminal dispatch removes.
pub struct LiveRegistry<S> {
    entries: Arc<DashMap<u64, Arc<Exchange<S>>>>,
}

impl<S> Clone for LiveRegistry<S> {
    fn clone(&self) -> Self {
        Self { entries: Arc::clone(&self.entries) }
    }
}

impl<S> Default for LiveRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> LiveRegistry<S> {
    pub fn new() -> Self {
        Self { entries: Arc::new(DashMap::new()) }
    }

    pub fn insert(&self, exchange: Arc<Exchange<S>>) {
        self.entries.insert(exchange.id(), exchange);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Exchange<S>>> {
        self.entries.remove(&id).map(|(_, ex)| ex)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Exchange<S>>> {
        self.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clone out every live exchange. The map is not locked while the
    /// caller inspects them.
    pub fn exchanges(&self) -> Vec<Arc<Exchange<S>>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }
}
