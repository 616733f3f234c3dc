//! Concurrent owner of every local `ProcessContext` and list-request lock.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;

use super::context::ProcessContext;
use super::lock::{ShowProcessListLock, DEFAULT_AWAIT_TIMEOUT};
use super::types::ProcessId;

static GLOBAL_REGISTRY: OnceLock<Arc<ProcessRegistry>> = OnceLock::new();

/// Process-wide tracking state of one proxy instance.
///
/// Contexts and locks live in two independently keyed maps. Callers never lock
/// anything themselves; each operation is a single sharded-map access.
#[derive(Debug)]
pub struct ProcessRegistry {
    contexts: DashMap<ProcessId, Arc<ProcessContext>>,
    locks: DashMap<ProcessId, Arc<ShowProcessListLock>>,
    lock_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_AWAIT_TIMEOUT)
    }

    /// Registry whose list-request locks wait at most `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            contexts: DashMap::new(),
            locks: DashMap::new(),
            lock_timeout,
        }
    }

    /// Lazily initialized registry shared by everything in this OS process.
    ///
    /// Single-instance deployments use this; tests and in-process fleets
    /// construct their own and inject it.
    pub fn global() -> Arc<ProcessRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(ProcessRegistry::new()))
            .clone()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Insert or overwrite. Ignored for an empty id.
    pub fn put(&self, id: ProcessId, context: Arc<ProcessContext>) {
        if id.is_empty() {
            return;
        }
        self.contexts.insert(id, context);
    }

    pub fn get(&self, id: &ProcessId) -> Option<Arc<ProcessContext>> {
        self.contexts.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &ProcessId) -> Option<Arc<ProcessContext>> {
        self.contexts.remove(id).map(|(_, context)| context)
    }

    /// Every registered context, in no particular order.
    pub fn contexts(&self) -> Vec<Arc<ProcessContext>> {
        self.contexts
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get_or_create_lock(&self, id: &ProcessId) -> Arc<ShowProcessListLock> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ShowProcessListLock::new(self.lock_timeout)))
            .value()
            .clone()
    }

    pub fn get_lock(&self, id: &ProcessId) -> Option<Arc<ShowProcessListLock>> {
        self.locks.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove_lock(&self, id: &ProcessId) {
        self.locks.remove(id);
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
