//! Controller stage: target vector in, velocity command out.
//!
//! Runs synchronously on whichever thread published the target, since one
//! controller step is cheap. The stage owns the time base: `dt` is measured
//! between consecutive samples and handed to the controller, which never reads
//! a clock itself.
//!
//! The controller is reset when
//! - the target generation changes (a new target has no error history)
//! - the target is lost
//! - no sample arrived for `controller.idle_reset_ms`
//! - activation is released while `input.require_activation` is set
//!
//! On loss nothing is submitted; the driver decays the last command on its own.

use crate::config::{Config, ControllerConfig};
use crate::controller::{build_controller, Controller};
use crate::state::StateStore;
use crate::types::{DriveCommand, SelectedTarget};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

struct ControlInner {
    controller: Box<dyn Controller>,
    config: ControllerConfig,
    /// Used as `dt` for the first sample after a reset
    nominal_dt: f64,
    require_activation: bool,
    generation: Option<u64>,
    last_sample: Option<Instant>,
    seq: u64,
}

impl ControlInner {
    fn reset(&mut self, reason: &str) {
        if self.generation.is_some() || self.last_sample.is_some() {
            debug!("Controller reset: {}", reason);
        }
        self.controller.reset();
        self.generation = None;
        self.last_sample = None;
    }
}

pub struct ControlStage {
    inner: Mutex<ControlInner>,
    store: Weak<StateStore>,
}

impl ControlStage {
    pub fn new(store: &Arc<StateStore>) -> Arc<Self> {
        let config = store.config.get();
        Arc::new(Self {
            inner: Mutex::new(ControlInner {
                controller: build_controller(&config.controller),
                config: config.controller.clone(),
                nominal_dt: config.capture.interval().as_secs_f64(),
                require_activation: config.input.require_activation,
                generation: None,
                last_sample: None,
                seq: 0,
            }),
            store: Arc::downgrade(store),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControlInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to target, activation and config changes
    pub fn attach(self: &Arc<Self>) {
        let Some(store) = self.store.upgrade() else {
            return;
        };

        let stage = Arc::clone(self);
        store.target.selected.subscribe(move |target| {
            stage.on_target(*target, Instant::now());
        });

        let stage = Arc::clone(self);
        store.input.activation_held.subscribe(move |held| {
            stage.on_activation(*held);
        });

        let stage = Arc::clone(self);
        store.config.subscribe(move |config| {
            stage.reconfigure(config);
        });
    }

    /// Process one target sample observed at `now`
    pub fn on_target(&self, target: Option<SelectedTarget>, now: Instant) -> Option<DriveCommand> {
        let store = self.store.upgrade();
        let mut inner = self.lock();

        let Some(target) = target else {
            inner.reset("target lost");
            drop(inner);
            if let Some(store) = store {
                store.control.error.set(None);
            }
            return None;
        };

        if inner.require_activation {
            let held = store
                .as_ref()
                .map_or(false, |s| s.input.activation_held.get());
            if !held {
                trace!("Activation not held, skipping target");
                return None;
            }
        }

        if inner.generation != Some(target.generation) {
            inner.reset("new target");
            inner.generation = Some(target.generation);
        }

        let idle_reset = inner.config.idle_reset();
        let dt = match inner.last_sample {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed > idle_reset {
                    inner.controller.reset();
                    debug!("Controller reset: idle for {:?}", elapsed);
                    inner.nominal_dt
                } else {
                    elapsed.as_secs_f64()
                }
            }
            None => inner.nominal_dt,
        };
        inner.last_sample = Some(now);

        let vector = inner.controller.compute(target.vector, dt);
        inner.seq += 1;
        let command = DriveCommand {
            vector,
            seq: inner.seq,
        };
        drop(inner);

        trace!(
            "error ({:.1}, {:.1}) dt {:.4} -> command ({:.1}, {:.1})",
            target.vector.x,
            target.vector.y,
            dt,
            vector.x,
            vector.y
        );

        if let Some(store) = store {
            store.control.error.set(Some(target.vector));
            store.control.command.set(command);
        }
        Some(command)
    }

    pub fn on_activation(&self, held: bool) {
        let mut inner = self.lock();
        if inner.require_activation && !held {
            inner.reset("activation released");
        }
    }

    /// Apply the controller and input sections of a new config
    pub fn reconfigure(&self, config: &Config) {
        let mut inner = self.lock();
        inner.nominal_dt = config.capture.interval().as_secs_f64();
        inner.require_activation = config.input.require_activation;

        if inner.config != config.controller {
            inner.controller = build_controller(&config.controller);
            inner.config = config.controller.clone();
            inner.generation = None;
            inner.last_sample = None;
            info!("Controller reconfigured ({})", config.controller.kind.as_str());
        }
    }

    /// Commands issued so far
    pub fn commands_issued(&self) -> u64 {
        self.lock().seq
    }

    pub fn idle_reset(&self) -> Duration {
        self.lock().config.idle_reset()
    }
}
