//! Observable value cells.
//!
//! A [`ValueCell`] holds the latest value of one field and notifies its
//! subscribers whenever a `set` actually changes that value. Cells are the only
//! channel between pipeline stages: each stage subscribes to the cell its
//! upstream stage publishes into.
//!
//! Subscribers run synchronously on the publishing thread, in registration
//! order. A subscriber that does heavy work must hand it off itself (see
//! [`crate::offload`]). A subscriber must never `set` the cell it is subscribed
//! to from inside its callback: the per-cell publish lock is held for the
//! whole fan-out, so that call would deadlock.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{error, trace};

/// Subscriber callback
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Change test: returns `true` when two values count as the same
pub type Comparator<T> = fn(&T, &T) -> bool;

/// Handle returned by [`ValueCell::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber<T> {
    id: u64,
    callback: Callback<T>,
}

/// Latest value of a field plus the subscribers interested in it
pub struct ValueCell<T> {
    name: &'static str,
    value: RwLock<T>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    /// Serializes store + fan-out so two sets never interleave
    publish: Mutex<()>,
    next_id: AtomicU64,
    same: Comparator<T>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn exact_eq<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

impl<T: Clone + PartialEq> ValueCell<T> {
    /// Create a cell that deduplicates with exact `PartialEq` equality.
    ///
    /// For floating point payloads this means any bit change passes through;
    /// use [`ValueCell::with_comparator`] for a tolerance.
    pub fn new(name: &'static str, value: T) -> Self {
        Self::with_comparator(name, value, exact_eq::<T>)
    }
}

impl<T: Clone> ValueCell<T> {
    /// Create a cell with a custom change test
    pub fn with_comparator(name: &'static str, value: T, same: Comparator<T>) -> Self {
        Self {
            name,
            value: RwLock::new(value),
            subscribers: Mutex::new(Vec::new()),
            publish: Mutex::new(()),
            next_id: AtomicU64::new(1),
            same,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Latest value
    pub fn get(&self) -> T {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `value` and notify subscribers if it differs from the current one.
    ///
    /// Returns `true` when the value changed and subscribers were notified.
    pub fn set(&self, value: T) -> bool {
        let _publish = lock(&self.publish);
        self.store_and_notify(value)
    }

    /// Compute the next value from the current one under the publish lock.
    ///
    /// Same notification rules as [`ValueCell::set`].
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let _publish = lock(&self.publish);
        let next = f(&self.get());
        self.store_and_notify(next)
    }

    fn store_and_notify(&self, value: T) -> bool {
        {
            let mut current = self.value.write().unwrap_or_else(PoisonError::into_inner);
            if (self.same)(&current, &value) {
                return false;
            }
            *current = value.clone();
        }
        self.notify(&value);
        true
    }

    fn notify(&self, value: &T) {
        let subscribers: Vec<(u64, Callback<T>)> = lock(&self.subscribers)
            .iter()
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();

        trace!("{}: notifying {} subscribers", self.name, subscribers.len());

        for (id, callback) in subscribers {
            self.invoke(id, &callback, value);
        }
    }

    fn invoke(&self, id: u64, callback: &Callback<T>, value: &T) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
            error!(
                "{}: subscriber {} panicked: {}",
                self.name,
                id,
                panic_message(payload.as_ref())
            );
        }
    }

    /// Register a callback for future changes. The current value is not replayed.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push(Subscriber {
            id,
            callback: Arc::new(callback),
        });
        SubscriptionHandle(id)
    }

    /// Register a callback and immediately invoke it once with the current value.
    ///
    /// Holds the publish lock across registration and replay, so the callback
    /// sees either the replayed value followed by every later change, never a gap.
    pub fn subscribe_and_replay(
        &self,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let _publish = lock(&self.publish);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        lock(&self.subscribers).push(Subscriber {
            id,
            callback: Arc::clone(&callback),
        });
        self.invoke(id, &callback, &self.get());
        SubscriptionHandle(id)
    }

    /// Remove a subscriber. Returns `false` if the handle was unknown.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.0);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for ValueCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCell")
            .field("name", &self.name)
            .field("value", &self.get())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Comparator treating two vectors as equal when both axes differ by less than 1e-6
pub fn vec2_approx_eq(a: &crate::types::Vec2, b: &crate::types::Vec2) -> bool {
    (a.x - b.x).abs() < 1e-6 && (a.y - b.y).abs() < 1e-6
}
