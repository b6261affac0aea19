//! Integer-keyed observer multiplexer.
//!
//! Observers connect callbacks and receive every notification until they
//! disconnect. The callback list is snapshotted before invocation, so an
//! observer is free to connect, disconnect, or notify again from inside
//! its callback without deadlocking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Key returned by [`Event::connect`], used to disconnect.
pub type ObserverKey = u32;

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Observers<A> {
    next_key: ObserverKey,
    connections: BTreeMap<ObserverKey, Callback<A>>,
}

/// Thread-safe observer set notified with a shared argument.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use kestrel::event::Event;
///
/// static TOTAL: AtomicU32 = AtomicU32::new(0);
///
/// let event: Event<u32> = Event::new();
/// let key = event.connect(|n| {
///     TOTAL.fetch_add(*n, Ordering::Relaxed);
/// });
///
/// event.notify(&3);
/// event.notify(&4);
/// assert_eq!(TOTAL.load(Ordering::Relaxed), 7);
///
/// assert!(event.disconnect(key));
/// event.notify(&100);
/// assert_eq!(TOTAL.load(Ordering::Relaxed), 7);
/// ```
pub struct Event<A> {
    observers: Mutex<Observers<A>>,
}

impl<A> Event<A> {
    /// Creates an event with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Observers {
                next_key: 0,
                connections: BTreeMap::new(),
            }),
        }
    }

    /// Registers an observer and returns its key.
    pub fn connect<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let mut observers = self.lock();
        let key = observers.next_key;
        observers.next_key = observers.next_key.wrapping_add(1);
        observers.connections.insert(key, Arc::new(f));
        key
    }

    /// Removes an observer. Returns `false` for an unknown key.
    pub fn disconnect(&self, key: ObserverKey) -> bool {
        self.lock().connections.remove(&key).is_some()
    }

    /// Invokes every connected observer with `arg`.
    ///
    /// The observer list is copied out of the lock before any callback
    /// runs; observers connected during the call are first invoked on the
    /// next notification.
    pub fn notify(&self, arg: &A) {
        let snapshot: Vec<Callback<A>> = self.lock().connections.values().cloned().collect();
        for callback in snapshot {
            callback(arg);
        }
    }

    /// Number of connected observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> MutexGuard<'_, Observers<A>> {
        // An observer that panicked mid-notify poisons the lock; the map
        // itself is still consistent, so keep going.
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A> Default for Event<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn observers_receive_notifications() {
        let event: Event<u32> = Event::new();
        let total = Arc::new(AtomicU32::new(0));

        let total_a = Arc::clone(&total);
        event.connect(move |n| {
            total_a.fetch_add(*n, Ordering::Relaxed);
        });
        let total_b = Arc::clone(&total);
        event.connect(move |n| {
            total_b.fetch_add(n * 10, Ordering::Relaxed);
        });

        event.notify(&2);
        assert_eq!(total.load(Ordering::Relaxed), 22);
    }

    #[test]
    fn disconnect_stops_delivery() {
        let event: Event<()> = Event::new();
        let count = Arc::new(AtomicU32::new(0));

        let count_obs = Arc::clone(&count);
        let key = event.connect(move |()| {
            count_obs.fetch_add(1, Ordering::Relaxed);
        });

        event.notify(&());
        assert!(event.disconnect(key));
        assert!(!event.disconnect(key));
        event.notify(&());

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn keys_are_distinct() {
        let event: Event<()> = Event::new();
        let a = event.connect(|()| {});
        let b = event.connect(|()| {});
        let c = event.connect(|()| {});
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(event.observer_count(), 3);
    }

    #[test]
    fn observers_may_reenter_from_callbacks() {
        let event: Arc<Event<u32>> = Arc::new(Event::new());
        let fired = Arc::new(AtomicU32::new(0));

        let reentrant = Arc::clone(&event);
        let fired_obs = Arc::clone(&fired);
        let key = event.connect(move |n| {
            fired_obs.fetch_add(1, Ordering::Relaxed);
            // Connecting from inside a callback must not deadlock.
            if *n == 0 {
                let fired_inner = Arc::clone(&fired_obs);
                reentrant.connect(move |_| {
                    fired_inner.fetch_add(100, Ordering::Relaxed);
                });
            }
        });

        event.notify(&0);
        // The freshly connected observer joins on the next notification.
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        event.notify(&1);
        assert_eq!(fired.load(Ordering::Relaxed), 102);

        assert!(event.disconnect(key));
    }
}
