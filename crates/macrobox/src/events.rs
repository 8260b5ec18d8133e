//! Observer registries for execution start/end notifications.
//!
//! Listeners run synchronously on the thread that emits the event, after the
//! executor has updated its live set. A listener can therefore query the
//! executor and see the state the event describes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener_id, _)| *listener_id != id);
    }
}

/// A list of listeners for one kind of event.
///
/// Clones share the same listener list.
pub struct EventEmitter<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<T: 'static> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<T: 'static> EventEmitter<T> {
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is disposed or dropped.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        let registry: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    /// Call every listener with `event`, in subscription order.
    pub fn emit(&self, event: &T) {
        // Snapshot so listeners may subscribe or unsubscribe while being called.
        let listeners: Vec<Listener<T>> = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle for a registered listener.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Subscription {
    /// Unregister the listener.
    pub fn dispose(mut self) {
        self.unsubscribe_now();
    }

    fn unsubscribe_now(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe_now();
    }
}
