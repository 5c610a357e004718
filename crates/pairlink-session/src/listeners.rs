//! Per-session listener registry.
//!
//! Each session owns its [`Listeners`]. Callbacks run on the worker, outside
//! the registry lock, so a listener may add or remove listeners.

use std::sync::{Arc, Mutex, PoisonError};

use pairlink_core::{Envelope, SessionStateKind};

/// Observes public state changes.
pub trait StateListener: Send + Sync {
    /// Session moved from `old` to `new`.
    fn on_state_changed(&self, old: SessionStateKind, new: SessionStateKind);
}

/// Observes inbound messages.
pub trait MessageListener: Send + Sync {
    /// A message arrived from the peer.
    fn on_message(&self, envelope: &Envelope);
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    state: Vec<(ListenerId, Arc<dyn StateListener>)>,
    message: Vec<(ListenerId, Arc<dyn MessageListener>)>,
}

impl Registry {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

/// State and message listeners of one session.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Mutex<Registry>>,
}

impl Listeners {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a state listener.
    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) -> ListenerId {
        let mut registry = self.registry();
        let id = registry.next_id();
        registry.state.push((id, listener));
        id
    }

    /// Add a message listener.
    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let mut registry = self.registry();
        let id = registry.next_id();
        registry.message.push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        let before = registry.state.len() + registry.message.len();
        registry.state.retain(|(l, _)| *l != id);
        registry.message.retain(|(l, _)| *l != id);
        before != registry.state.len() + registry.message.len()
    }

    /// Notify state listeners.
    pub fn notify_state(&self, old: SessionStateKind, new: SessionStateKind) {
        let listeners: Vec<_> = self.registry().state.iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener.on_state_changed(old, new);
        }
    }

    /// Notify message listeners.
    pub fn notify_message(&self, envelope: &Envelope) {
        let listeners: Vec<_> =
            self.registry().message.iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener.on_message(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl StateListener for Counter {
        fn on_state_changed(&self, _old: SessionStateKind, _new: SessionStateKind) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let listeners = Listeners::new();
        let counter = Arc::new(Counter::default());
        let id = listeners.add_state_listener(Arc::clone(&counter) as Arc<dyn StateListener>);

        listeners.notify_state(SessionStateKind::Disconnected, SessionStateKind::Connecting);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.notify_state(SessionStateKind::Connecting, SessionStateKind::Connected);

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    struct Reentrant {
        listeners: Listeners,
    }

    impl StateListener for Reentrant {
        fn on_state_changed(&self, _old: SessionStateKind, _new: SessionStateKind) {
            self.listeners.add_state_listener(Arc::new(Counter::default()));
        }
    }

    #[test]
    fn listener_may_register_during_notification() {
        let listeners = Listeners::new();
        listeners.add_state_listener(Arc::new(Reentrant { listeners: listeners.clone() }));

        listeners.notify_state(SessionStateKind::Disconnected, SessionStateKind::Connecting);

        assert_eq!(listeners.registry().state.len(), 2);
    }
}
