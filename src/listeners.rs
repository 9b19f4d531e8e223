//! Local pub/sub: event name → ordered subscriber callbacks.
//!
//! Every component that surfaces lifecycle events (client connection state,
//! server connect/disconnect, broadcast delivery) owns one registry. A
//! registry is not synchronized; owners keep it behind their own lock and
//! fire from a [`ListenerRegistry::snapshot`] so callbacks never run while
//! the lock is held.
//!
//! Listener identity is `Arc` pointer identity: registering the same
//! [`Listener`] twice stores it twice, and [`ListenerRegistry::remove_listener`]
//! removes only the first match.

use std::collections::HashMap;
use std::sync::Arc;

/// A subscriber callback.
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<A, F>(f: F) -> Listener<A>
where
    F: Fn(&A) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Map of event name to subscribers, called in insertion order.
pub struct ListenerRegistry<A> {
    listeners: HashMap<String, Vec<Listener<A>>>,
}

impl<A> std::fmt::Debug for ListenerRegistry<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("event_count", &self.listeners.len())
            .field("total_listeners", &self.listener_count())
            .finish()
    }
}

impl<A> Default for ListenerRegistry<A> {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }
}

impl<A> ListenerRegistry<A> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener` to the subscribers of `event`.
    pub fn add_listener(&mut self, event: &str, listener: Listener<A>) -> &mut Self {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(listener);
        self
    }

    /// Remove the first subscriber of `event` that is the same `Arc` as `listener`.
    ///
    /// No-op when nothing matches.
    pub fn remove_listener(&mut self, event: &str, listener: &Listener<A>) -> &mut Self {
        if let Some(list) = self.listeners.get_mut(event) {
            if let Some(idx) = list.iter().position(|l| Arc::ptr_eq(l, listener)) {
                list.remove(idx);
            }
            if list.is_empty() {
                self.listeners.remove(event);
            }
        }
        self
    }

    /// Drop every subscriber of `event`.
    pub fn clear(&mut self, event: &str) -> &mut Self {
        self.listeners.remove(event);
        self
    }

    /// Drop every subscriber of every event.
    pub fn clear_all(&mut self) -> &mut Self {
        self.listeners.clear();
        self
    }

    /// Whether `event` has at least one subscriber.
    pub fn has(&self, event: &str) -> bool {
        self.listeners.get(event).is_some_and(|l| !l.is_empty())
    }

    /// Clone the current subscribers of `event`, in insertion order.
    pub fn snapshot(&self, event: &str) -> Vec<Listener<A>> {
        self.listeners.get(event).cloned().unwrap_or_default()
    }

    /// Call every subscriber of `event` with `args`. No-op without subscribers.
    pub fn fire(&self, event: &str, args: &A) {
        if let Some(list) = self.listeners.get(event) {
            for listener in list {
                listener(args);
            }
        }
    }

    /// Total subscribers across all events.
    pub fn listener_count(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }
}

/// Call each listener in `snapshot` with `args`.
///
/// Pairs with [`ListenerRegistry::snapshot`] for owners that keep the
/// registry behind a lock.
pub fn fire_all<A>(snapshot: &[Listener<A>], args: &A) {
    for listener in snapshot {
        listener(args);
    }
}
