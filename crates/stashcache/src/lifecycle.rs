//! Host lifecycle signals
//!
//! The host posts events (memory pressure, moving to the background) to a
//! [`LifecycleHub`]; memory caches subscribe at construction and unsubscribe
//! when dropped.

use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// A host lifecycle event, delivered once per occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The process is under memory pressure
    MemoryWarning,
    /// The application moved to the background
    EnteredBackground,
}

type Listener = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

static GLOBAL: Lazy<LifecycleHub> = Lazy::new(LifecycleHub::new);

/// Fan-out point for lifecycle events
#[derive(Clone, Default)]
pub struct LifecycleHub {
    listeners: Arc<Mutex<Listeners>>,
}

impl LifecycleHub {
    /// Create an isolated hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide hub that caches use unless given another
    pub fn global() -> &'static LifecycleHub {
        &GLOBAL
    }

    /// Register a listener; it stays registered until the returned
    /// subscription is dropped
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(LifecycleEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Deliver an event to every current listener
    pub fn post(&self, event: LifecycleEvent) {
        // Listeners run outside the lock so they may subscribe or drop
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }
}

/// Registration handle; unsubscribes on drop
pub struct Subscription {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_post_reaches_subscribers() {
        let hub = LifecycleHub::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let _sub = hub.subscribe(move |event| {
            if event == LifecycleEvent::MemoryWarning {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        hub.post(LifecycleEvent::MemoryWarning);
        hub.post(LifecycleEvent::EnteredBackground);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = LifecycleHub::new();
        let sub = hub.subscribe(|_| {});
        assert_eq!(hub.listener_count(), 1);

        drop(sub);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_hub() {
        let hub = LifecycleHub::new();
        let sub = hub.subscribe(|_| {});
        drop(hub);
        drop(sub);
    }
}
