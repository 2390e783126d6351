//! Lifecycle hooks: observing graph-completion events without touching
//! graph-building code.
//!
//! Listeners are registered on an explicit registry instance with scoped
//! acquisition: registration returns a guard that deregisters on drop, and
//! delivery only happens while a [`CallbackScope`] is armed. The runner arms
//! a scope around every evaluation, so listeners always see the result of a
//! completed `run()`. Failed evaluations never notify.

use crate::graph::TaskValue;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Listener = Arc<dyn Fn(&TaskValue) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    listeners: RwLock<Vec<(u64, Listener)>>,
    scopes: RwLock<Vec<(u64, String)>>,
    next_id: AtomicU64,
}

/// Registry of graph-completion listeners. Cheap to clone; clones share
/// state, and registration and delivery are safe under concurrent graph
/// evaluations.
#[derive(Clone, Default)]
pub struct HookRegistry {
    state: Arc<RegistryState>,
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener invoked with the final result of every graph
    /// evaluation that completes successfully while a scope is armed.
    ///
    /// The listener stays registered until the returned guard is dropped.
    /// Listeners sharing state across concurrent evaluations must guard it
    /// with their own mutual exclusion.
    #[must_use = "the listener is deregistered when the guard is dropped"]
    pub fn register_listener(
        &self,
        listener: impl Fn(&TaskValue) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .listeners
            .write()
            .push((id, Arc::new(listener)));

        ListenerGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Arms completion tracking for the duration of the returned scope.
    #[must_use = "tracking is disarmed when the scope is dropped"]
    pub fn scope(&self, name: impl Into<String>) -> CallbackScope {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        self.state.scopes.write().push((id, name.clone()));

        CallbackScope {
            registry: self.clone(),
            id,
            name,
        }
    }

    /// Whether at least one callback scope is currently armed.
    #[must_use]
    pub fn armed(&self) -> bool {
        !self.state.scopes.read().is_empty()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.listeners.read().len()
    }

    /// Delivers a completed result to every registered listener.
    ///
    /// Each listener is invoked at most once per completed evaluation;
    /// delivery order across listeners is unspecified. No-op unless a scope
    /// is armed.
    pub fn notify(&self, value: &TaskValue) {
        if !self.armed() {
            return;
        }

        // Snapshot outside the lock so listeners may themselves register
        // or deregister.
        let listeners: Vec<Listener> = self
            .state
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    fn remove_listener(&self, id: u64) {
        self.state
            .listeners
            .write()
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn remove_scope(&self, id: u64) {
        self.state
            .scopes
            .write()
            .retain(|(scope_id, _)| *scope_id != id);
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("listeners", &self.listener_count())
            .field("armed", &self.armed())
            .finish()
    }
}

/// Keeps a listener registered; dropping it deregisters the listener.
pub struct ListenerGuard {
    registry: HookRegistry,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.remove_listener(self.id);
    }
}

/// An armed callback scope wrapping a graph evaluation.
pub struct CallbackScope {
    registry: HookRegistry,
    id: u64,
    name: String,
}

impl CallbackScope {
    /// The name this scope was armed with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        self.registry.remove_scope(self.id);
    }
}
