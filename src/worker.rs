//! Fixed-rate background loops.
//!
//! [`LoopThread`] runs a body on a dedicated OS thread until stopped. The body
//! returns the interval to the next tick; ticks are scheduled against absolute
//! deadlines so per-tick work does not accumulate as drift. An overrun tick
//! resynchronizes to "now" instead of bursting to catch up. A panicking tick
//! is logged and skipped; the loop keeps its last interval.

use crate::types::PipelineError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Interval used when a tick panics before any tick has completed
const FALLBACK_INTERVAL: Duration = Duration::from_millis(10);

/// A named thread running a loop body until [`LoopThread::stop`]
pub struct LoopThread {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawn `body` on a new thread. Each call runs one tick and returns the
    /// delay until the next.
    pub fn spawn<F>(name: &str, mut body: F) -> Result<Self, PipelineError>
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("{} loop started", thread_name);
                let mut next = Instant::now();
                let mut interval = FALLBACK_INTERVAL;

                while running_clone.load(Ordering::SeqCst) {
                    match panic::catch_unwind(AssertUnwindSafe(&mut body)) {
                        Ok(d) => interval = d,
                        Err(_) => error!("{} tick panicked, skipping", thread_name),
                    }
                    next += interval;

                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }

                debug!("{} loop exited", thread_name);
            })
            .map_err(|source| PipelineError::Spawn {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handle.is_some()
    }

    /// Signal the loop to exit and join it. No tick runs after this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} loop panicked", self.name);
            }
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}
