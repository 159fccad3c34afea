//! Observer list with unsubscribe tokens.
//!
//! Used for file-change fan-out (manager and synchronizer) and for workspace
//! state transitions. Callbacks run synchronously on the emitting task, outside
//! the registry lock, so a callback may subscribe or unsubscribe freely.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<T>>,
}

/// A set of callbacks notified with every emitted value.
pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed, or the set is cleared.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.inner.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::from_fn(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().callbacks.remove(&id);
            }
        })
    }

    /// Notify every registered callback, in registration order.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self.inner.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }

    /// Drop every registered callback. Outstanding subscriptions become inert.
    pub fn clear(&self) {
        self.inner.lock().callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Unsubscribe token. Dropping it removes the callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn from_fn<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered for the lifetime of the observer set.
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_all_subscribers() {
        let observers = Observers::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = Arc::clone(&total);
        let _a = observers.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = Arc::clone(&total);
        let _b = observers.subscribe(move |v| {
            t2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        observers.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unsubscribe_and_drop_remove_callback() {
        let observers = Observers::<()>::new();
        let a = observers.subscribe(|_| {});
        let b = observers.subscribe(|_| {});
        assert_eq!(observers.len(), 2);

        a.unsubscribe();
        assert_eq!(observers.len(), 1);

        drop(b);
        assert!(observers.is_empty());
    }

    #[test]
    fn detach_keeps_callback() {
        let observers = Observers::<()>::new();
        observers.subscribe(|_| {}).detach();
        assert_eq!(observers.len(), 1);
        observers.clear();
        assert!(observers.is_empty());
    }

    #[test]
    fn callback_may_subscribe_during_emit() {
        let observers = Observers::<()>::new();
        let clone = observers.clone();
        let _s = observers.subscribe(move |_| {
            clone.subscribe(|_| {}).detach();
        });
        observers.emit(&());
        assert_eq!(observers.len(), 2);
    }
}
