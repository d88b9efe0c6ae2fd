//! Moving subscriber work off the publishing thread.
//!
//! Cells run subscribers synchronously, so anything slow (inference, scoring)
//! wraps itself with [`Offload`] to run on the worker pool instead. Stages that
//! must never queue stale work also take a [`SkipIfBusy`] gate: a notification
//! that arrives while the previous job is still running is dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, trace};

/// Handle to the worker pool used for offloaded subscribers
#[derive(Clone)]
pub struct Offload {
    handle: Handle,
}

impl Offload {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Run `job` on the blocking pool. Panics are caught and logged.
    pub fn spawn(&self, name: &'static str, job: impl FnOnce() + Send + 'static) {
        self.handle.spawn_blocking(move || {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("{}: offloaded job panicked", name);
            }
        });
    }

    /// Wrap `f` as a cell subscriber that runs every notification on the pool
    pub fn subscriber<T, F>(&self, name: &'static str, f: F) -> impl Fn(&T) + Send + Sync + 'static
    where
        T: Clone + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let pool = self.clone();
        let f = Arc::new(f);
        move |value: &T| {
            let f = Arc::clone(&f);
            let value = value.clone();
            pool.spawn(name, move || f(value));
        }
    }

    /// Like [`Offload::subscriber`], but drops notifications while `gate` is busy
    pub fn exclusive_subscriber<T, F>(
        &self,
        name: &'static str,
        gate: SkipIfBusy,
        f: F,
    ) -> impl Fn(&T) + Send + Sync + 'static
    where
        T: Clone + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let pool = self.clone();
        let f = Arc::new(f);
        move |value: &T| match gate.try_acquire() {
            Some(guard) => {
                let f = Arc::clone(&f);
                let value = value.clone();
                pool.spawn(name, move || {
                    let _guard = guard;
                    f(value);
                });
            }
            None => trace!("{}: previous job still running, dropping notification", name),
        }
    }
}

/// Non-blocking try-lock. Contention means "drop this one", never "wait".
#[derive(Debug, Clone, Default)]
pub struct SkipIfBusy {
    busy: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

/// Held while a guarded action runs; releases the gate on drop
#[derive(Debug)]
pub struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl SkipIfBusy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate if it is free
    pub fn try_acquire(&self) -> Option<BusyGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(BusyGuard {
                busy: Arc::clone(&self.busy),
            })
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Run `f` if the gate is free, otherwise return `None` immediately
    pub fn try_run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.try_acquire()?;
        Some(f())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Number of actions dropped because the gate was busy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
