// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber registry shared by the transfer queue and the offline reconciler.
//!
//! Every publication carries a sequence number taken while the publisher still
//! held its state lock. Publications that arrive out of order are dropped, so
//! a listener never sees an older state after a newer one.
//!
//! Listeners run while the registry is locked. They may read from the service
//! that owns the registry but must not subscribe from inside a callback.

use std::sync::{Arc, Mutex, Weak};

use crate::locks::resilient_lock;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    last_seq: u64,
    latest: T,
    listeners: Vec<(u64, Listener<T>)>,
}

/// Broadcasts state snapshots to registered listeners.
pub struct Observers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: Send + 'static> Observers<T> {
    /// Create a registry whose current value is `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                last_seq: 0,
                latest: initial,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register `listener`. It is called immediately with the latest value and
    /// again on every later publication until the subscription is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = resilient_lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;

        listener(&registry.latest);
        registry.listeners.push((id, Arc::new(listener)));

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    resilient_lock(&registry).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Publish `value` as state number `seq`. Stale publications are dropped.
    pub fn publish(&self, seq: u64, value: T) {
        let mut registry = resilient_lock(&self.registry);
        if seq <= registry.last_seq {
            tracing::trace!(seq, last = registry.last_seq, "dropping stale publication");
            return;
        }
        registry.last_seq = seq;
        registry.latest = value;

        let registry = &*registry;
        for (_, listener) in &registry.listeners {
            listener(&registry.latest);
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        resilient_lock(&self.registry).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of the publisher.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&u32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &u32| sink.lock().unwrap().push(*v))
    }

    #[test]
    fn test_subscribe_delivers_current_value() {
        let observers = Observers::new(3u32);
        let (seen, listener) = recorder();
        let _sub = observers.subscribe(listener);
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_publish_reaches_listeners_in_order() {
        let observers = Observers::new(0u32);
        let (seen, listener) = recorder();
        let _sub = observers.subscribe(listener);

        observers.publish(1, 10);
        observers.publish(2, 20);
        assert_eq!(*seen.lock().unwrap(), vec![0, 10, 20]);
    }

    #[test]
    fn test_stale_publication_dropped() {
        let observers = Observers::new(0u32);
        let (seen, listener) = recorder();
        let _sub = observers.subscribe(listener);

        observers.publish(5, 50);
        observers.publish(4, 40);
        assert_eq!(*seen.lock().unwrap(), vec![0, 50]);
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let observers = Observers::new(0u32);
        let (seen_a, a) = recorder();
        let (seen_b, b) = recorder();
        let sub_a = observers.subscribe(a);
        {
            let _sub_b = observers.subscribe(b);
            assert_eq!(observers.len(), 2);
        }
        assert_eq!(observers.len(), 1);

        sub_a.unsubscribe();
        assert!(observers.is_empty());

        observers.publish(1, 9);
        assert_eq!(*seen_a.lock().unwrap(), vec![0]);
        assert_eq!(*seen_b.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_detach_keeps_listener() {
        let observers = Observers::new(0u32);
        let (seen, listener) = recorder();
        observers.subscribe(listener).detach();
        observers.publish(1, 1);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }
}
