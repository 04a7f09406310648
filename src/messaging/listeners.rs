//! Typed listener lists with per-subscriber failure isolation
//!
//! Callbacks run synchronously on the notifying task, in subscription order.
//! A panicking callback is logged and skipped; the remaining subscribers still
//! receive the value.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Listeners::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct Listeners<T> {
    name: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("name", &self.name)
            .field("count", &self.len())
            .finish()
    }
}

impl<T> Listeners<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Callback<T>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `value` to every subscriber; returns how many returned normally
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking
        let snapshot: Vec<(ListenerId, Callback<T>)> = self.entries().clone();
        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(listeners = self.name, listener = id.0, %reason, "Listener panicked");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_all_subscribers_receive_value() {
        let listeners = Listeners::<u32>::new("test");
        let sum = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let sum = sum.clone();
            listeners.subscribe(move |v| {
                sum.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }
        assert_eq!(listeners.notify(&2), 3);
        assert_eq!(sum.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let listeners = Listeners::<&'static str>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        listeners.subscribe(move |v| first.lock().unwrap().push(format!("a:{v}")));
        listeners.subscribe(|_| panic!("listener failure"));
        let last = seen.clone();
        listeners.subscribe(move |v| last.lock().unwrap().push(format!("c:{v}")));

        assert_eq!(listeners.notify(&"x"), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a:x", "c:x"]);
    }

    #[test]
    fn test_unsubscribe() {
        let listeners = Listeners::<()>::new("test");
        let id = listeners.subscribe(|_| {});
        assert_eq!(listeners.len(), 1);
        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let listeners = Arc::new(Listeners::<()>::new("test"));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let inner = listeners.clone();
        let inner_slot = slot.clone();
        let id = listeners.subscribe(move |_| {
            if let Some(id) = *inner_slot.lock().unwrap() {
                inner.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        listeners.notify(&());
        assert!(listeners.is_empty());
    }
}
