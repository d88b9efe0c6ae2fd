//! Actuation driver loop.
//!
//! Converts a commanded velocity (pixels/second) into integer pointer steps at
//! a fixed tick rate. Each tick:
//!
//! 1. once the last command is older than `max_duration`, the velocity decays
//!    by `decay_rate` and snaps to zero under `stop_threshold`
//! 2. the per-tick step `velocity / rate_hz` is exponentially smoothed
//! 3. the smoothed step is added to a sub-pixel residual; the integer part
//!    (truncated toward zero) is emitted and removed from the residual
//!
//! Emitted motion plus the residual always equals the accumulated smoothed
//! displacement, so fractional steps are never lost.

use crate::actuator::Actuator;
use crate::config::DriverConfig;
use crate::state::DriverState;
use crate::types::{PipelineError, Vec2};
use crate::worker::LoopThread;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Driver state machine phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverPhase {
    /// No velocity
    #[default]
    Idle,
    /// Following a command submitted within `max_duration`
    Driving,
    /// Command expired, velocity decaying toward zero
    Decaying,
}

/// Tick parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverParams {
    pub rate_hz: f64,
    pub smoothing: f64,
    pub max_duration: Duration,
    pub decay_rate: f64,
    pub stop_threshold: f64,
}

impl DriverParams {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            rate_hz: config.fps.max(1) as f64,
            smoothing: config.smoothing.clamp(f64::MIN_POSITIVE, 1.0),
            max_duration: config.max_duration(),
            decay_rate: config.decay_rate,
            stop_threshold: config.stop_threshold,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }
}

impl Default for DriverParams {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

/// Tick logic of the driver, independent of threads and wall clock
#[derive(Debug, Clone)]
pub struct DriverCore {
    params: DriverParams,
    velocity: Vec2,
    smoothed: Vec2,
    residual: Vec2,
    last_submit: Option<Instant>,
    phase: DriverPhase,
    emitted_total: (i64, i64),
    smoothed_total: Vec2,
}

impl DriverCore {
    pub fn new(params: DriverParams) -> Self {
        Self {
            params,
            velocity: Vec2::ZERO,
            smoothed: Vec2::ZERO,
            residual: Vec2::ZERO,
            last_submit: None,
            phase: DriverPhase::Idle,
            emitted_total: (0, 0),
            smoothed_total: Vec2::ZERO,
        }
    }

    pub fn params(&self) -> &DriverParams {
        &self.params
    }

    pub fn set_params(&mut self, params: DriverParams) {
        self.params = params;
    }

    pub fn velocity(&self) -> Vec2 {
        self.velocity
    }

    pub fn residual(&self) -> Vec2 {
        self.residual
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    /// Sum of every emitted step
    pub fn emitted_total(&self) -> (i64, i64) {
        self.emitted_total
    }

    /// Sum of every smoothed step
    pub fn smoothed_total(&self) -> Vec2 {
        self.smoothed_total
    }

    /// Set the commanded velocity and restart the `max_duration` window
    pub fn submit(&mut self, velocity: Vec2, now: Instant) {
        self.velocity = if velocity.is_finite() {
            velocity
        } else {
            Vec2::ZERO
        };
        self.last_submit = Some(now);
        self.phase = if self.velocity.is_zero() {
            DriverPhase::Idle
        } else {
            DriverPhase::Driving
        };
    }

    /// Drop velocity, smoothing history and residual
    pub fn halt(&mut self) {
        self.velocity = Vec2::ZERO;
        self.smoothed = Vec2::ZERO;
        self.residual = Vec2::ZERO;
        self.phase = DriverPhase::Idle;
    }

    fn expired(&self, now: Instant) -> bool {
        match self.last_submit {
            Some(t) => now.saturating_duration_since(t) > self.params.max_duration,
            None => true,
        }
    }

    /// Advance one tick. Returns the integer step to emit, if any.
    pub fn tick(&mut self, now: Instant) -> Option<(i32, i32)> {
        let p = self.params;

        if !self.velocity.is_zero() && self.expired(now) {
            self.velocity = self.velocity * p.decay_rate;
            // NaN length or threshold also snaps, so decay always terminates
            if !(self.velocity.length() >= p.stop_threshold) {
                self.velocity = Vec2::ZERO;
            }
        }

        self.phase = if self.velocity.is_zero() {
            DriverPhase::Idle
        } else if self.expired(now) {
            DriverPhase::Decaying
        } else {
            DriverPhase::Driving
        };

        let target_step = self.velocity * (1.0 / p.rate_hz);
        self.smoothed = target_step * p.smoothing + self.smoothed * (1.0 - p.smoothing);
        if self.velocity.is_zero() && self.smoothed.length() < 1e-9 {
            self.smoothed = Vec2::ZERO;
        }
        self.smoothed_total += self.smoothed;

        self.residual += self.smoothed;
        let emit = self
            .residual
            .map(|v| v.trunc().clamp(i32::MIN as f64, i32::MAX as f64));
        self.residual -= emit;

        if emit.is_zero() {
            return None;
        }

        let step = (emit.x as i32, emit.y as i32);
        self.emitted_total.0 += step.0 as i64;
        self.emitted_total.1 += step.1 as i64;
        Some(step)
    }
}

struct DriverShared {
    core: Mutex<DriverCore>,
    actuator: Mutex<Box<dyn Actuator>>,
    telemetry: Option<Weak<crate::state::StateStore>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DriverShared {
    fn tick(&self) -> Duration {
        let now = Instant::now();
        let (step, velocity, phase, interval) = {
            let mut core = lock(&self.core);
            let step = core.tick(now);
            (step, core.velocity(), core.phase(), core.params().tick_interval())
        };

        if let Some((dx, dy)) = step {
            lock(&self.actuator).move_relative(dx, dy);
        }

        if let Some(store) = self.telemetry.as_ref().and_then(Weak::upgrade) {
            publish_telemetry(&store.driver, velocity, phase);
        }

        interval
    }
}

fn publish_telemetry(cells: &DriverState, velocity: Vec2, phase: DriverPhase) {
    cells.velocity.set(velocity);
    cells.phase.set(phase);
}

/// Fixed-rate driver thread wrapping a [`DriverCore`] and an [`Actuator`]
pub struct ActuationDriver {
    shared: Arc<DriverShared>,
    worker: Mutex<Option<LoopThread>>,
}

impl ActuationDriver {
    pub fn new(params: DriverParams, actuator: Box<dyn Actuator>) -> Self {
        Self::build(params, actuator, None)
    }

    /// Driver that also publishes velocity and phase into `store.driver`
    pub fn with_telemetry(
        params: DriverParams,
        actuator: Box<dyn Actuator>,
        store: &Arc<crate::state::StateStore>,
    ) -> Self {
        Self::build(params, actuator, Some(Arc::downgrade(store)))
    }

    fn build(
        params: DriverParams,
        actuator: Box<dyn Actuator>,
        telemetry: Option<Weak<crate::state::StateStore>>,
    ) -> Self {
        Self {
            shared: Arc::new(DriverShared {
                core: Mutex::new(DriverCore::new(params)),
                actuator: Mutex::new(actuator),
                telemetry,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the loop thread. Starting a running driver is a no-op.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(LoopThread::is_running) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let params = *lock(&self.shared.core).params();
        *worker = Some(LoopThread::spawn("actuation-driver", move || shared.tick())?);

        let actuator = lock(&self.shared.actuator).name().to_string();
        info!(
            "Actuation driver started at {} Hz (actuator: {})",
            params.rate_hz, actuator
        );
        Ok(())
    }

    /// Stop and join the loop thread; no motion is emitted after this returns
    pub fn stop(&self) {
        if let Some(mut worker) = lock(&self.worker).take() {
            worker.stop();
            lock(&self.shared.core).halt();
            if let Some(store) = self.shared.telemetry.as_ref().and_then(Weak::upgrade) {
                publish_telemetry(&store.driver, Vec2::ZERO, DriverPhase::Idle);
            }
            info!("Actuation driver stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(LoopThread::is_running)
    }

    /// Set the commanded velocity. Safe to call from any thread.
    pub fn submit_vector(&self, vx: f64, vy: f64) {
        lock(&self.shared.core).submit(Vec2::new(vx, vy), Instant::now());
    }

    /// Apply new tick parameters from the next tick on
    pub fn update_params(&self, params: DriverParams) {
        let mut core = lock(&self.shared.core);
        if *core.params() != params {
            debug!("Driver parameters updated: {:?}", params);
            core.set_params(params);
        }
    }

    pub fn velocity(&self) -> Vec2 {
        lock(&self.shared.core).velocity()
    }

    pub fn phase(&self) -> DriverPhase {
        lock(&self.shared.core).phase()
    }

    pub fn emitted_total(&self) -> (i64, i64) {
        lock(&self.shared.core).emitted_total()
    }
}

impl Drop for ActuationDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::RecordingActuator;
    use proptest::prelude::*;
    use std::thread;

    fn params(rate_hz: f64, smoothing: f64, max_duration: Duration) -> DriverParams {
        DriverParams {
            rate_hz,
            smoothing,
            max_duration,
            decay_rate: 0.9,
            stop_threshold: 1.0,
        }
    }

    /// Run `n` ticks spaced by the tick interval starting at `start`
    fn run_ticks(core: &mut DriverCore, start: Instant, n: u32) -> (i64, i64) {
        let interval = core.params().tick_interval();
        let mut total = (0i64, 0i64);
        for i in 0..n {
            if let Some((dx, dy)) = core.tick(start + interval * (i + 1)) {
                total.0 += dx as i64;
                total.1 += dy as i64;
            }
        }
        total
    }

    #[test]
    fn test_idle_core_emits_nothing() {
        let mut core = DriverCore::new(DriverParams::default());
        let now = Instant::now();
        assert_eq!(run_ticks(&mut core, now, 100), (0, 0));
        assert_eq!(core.phase(), DriverPhase::Idle);
    }

    #[test]
    fn test_constant_velocity_conserves_displacement() {
        let mut core = DriverCore::new(params(1000.0, 1.0, Duration::from_secs(3600)));
        let start = Instant::now();
        core.submit(Vec2::new(333.0, -125.0), start);

        let total = run_ticks(&mut core, start, 1000);

        assert!((total.0 - 333).abs() <= 1, "x total {}", total.0);
        assert!((total.1 + 125).abs() <= 1, "y total {}", total.1);
        assert_eq!(core.phase(), DriverPhase::Driving);
    }

    #[test]
    fn test_sub_pixel_steps_accumulate() {
        // 0.25 px per tick: one pixel every fourth tick
        let mut core = DriverCore::new(params(1000.0, 1.0, Duration::from_secs(3600)));
        let start = Instant::now();
        core.submit(Vec2::new(250.0, 0.0), start);

        let interval = core.params().tick_interval();
        let emitted: Vec<_> = (1..=8).map(|i| core.tick(start + interval * i)).collect();
        assert_eq!(emitted.iter().flatten().count(), 2);
        assert!(emitted.iter().flatten().all(|&s| s == (1, 0)));
    }

    #[test]
    fn test_negative_steps_truncate_toward_zero() {
        let mut core = DriverCore::new(params(10.0, 1.0, Duration::from_secs(3600)));
        let start = Instant::now();
        core.submit(Vec2::new(-15.0, 0.0), start);

        // -1.5 per tick: emits -1 and keeps -0.5
        assert_eq!(core.tick(start), Some((-1, 0)));
        assert!((core.residual().x + 0.5).abs() < 1e-12);
        assert_eq!(core.tick(start), Some((-2, 0)));
        assert_eq!(core.residual().x, 0.0);
    }

    #[test]
    fn test_emitted_plus_residual_equals_smoothed_total() {
        let mut core = DriverCore::new(params(500.0, 0.3, Duration::from_millis(20)));
        let start = Instant::now();
        core.submit(Vec2::new(700.0, 90.0), start);
        run_ticks(&mut core, start, 50);
        core.submit(Vec2::new(-200.0, 400.0), start + Duration::from_millis(100));
        run_ticks(&mut core, start + Duration::from_millis(100), 200);

        let (ex, ey) = core.emitted_total();
        let smoothed = core.smoothed_total();
        assert!((ex as f64 + core.residual().x - smoothed.x).abs() < 1e-6);
        assert!((ey as f64 + core.residual().y - smoothed.y).abs() < 1e-6);
    }

    #[test]
    fn test_decay_reaches_exact_zero_monotonically() {
        let mut core = DriverCore::new(params(1000.0, 0.5, Duration::from_millis(10)));
        let start = Instant::now();
        core.submit(Vec2::new(100.0, 0.0), start);

        let interval = core.params().tick_interval();
        // Jump past max_duration so every tick decays
        let expired = start + Duration::from_millis(20);
        let mut last = core.velocity().x;
        let mut ticks = 0;

        while !core.velocity().is_zero() {
            core.tick(expired + interval * ticks);
            let v = core.velocity().x;
            if v != 0.0 {
                assert!((v - last * 0.9).abs() < 1e-9);
                assert_eq!(core.phase(), DriverPhase::Decaying);
            }
            assert!(v < last);
            last = v;
            ticks += 1;
            assert!(ticks < 100, "velocity never reached zero");
        }

        assert_eq!(core.velocity(), Vec2::ZERO);
        assert_eq!(core.phase(), DriverPhase::Idle);
        // 100 * 0.9^n < 1 first holds at n = 44
        assert_eq!(ticks, 44);
    }

    #[test]
    fn test_decay_terminates_with_nan_threshold() {
        let mut p = params(1000.0, 1.0, Duration::from_millis(10));
        p.stop_threshold = f64::NAN;
        let mut core = DriverCore::new(p);
        let start = Instant::now();
        core.submit(Vec2::new(100.0, 0.0), start);

        core.tick(start + Duration::from_millis(20));
        assert_eq!(core.velocity(), Vec2::ZERO);
        assert_eq!(core.phase(), DriverPhase::Idle);
    }

    #[test]
    fn test_oversized_step_stays_in_residual() {
        let mut core = DriverCore::new(params(1.0, 1.0, Duration::from_secs(3600)));
        let start = Instant::now();
        core.submit(Vec2::new(1e12, -1e12), start);

        assert_eq!(core.tick(start), Some((i32::MAX, i32::MIN)));
        let (ex, ey) = core.emitted_total();
        let smoothed = core.smoothed_total();
        assert_eq!(ex as f64 + core.residual().x, smoothed.x);
        assert_eq!(ey as f64 + core.residual().y, smoothed.y);
    }

    #[test]
    fn test_no_decay_within_max_duration() {
        let mut core = DriverCore::new(params(1000.0, 1.0, Duration::from_millis(50)));
        let start = Instant::now();
        core.submit(Vec2::new(100.0, 0.0), start);

        core.tick(start + Duration::from_millis(49));
        assert_eq!(core.velocity(), Vec2::new(100.0, 0.0));

        core.tick(start + Duration::from_millis(51));
        assert_eq!(core.velocity(), Vec2::new(90.0, 0.0));
    }

    #[test]
    fn test_resubmit_restarts_window() {
        let mut core = DriverCore::new(params(1000.0, 1.0, Duration::from_millis(50)));
        let start = Instant::now();
        core.submit(Vec2::new(100.0, 0.0), start);
        core.submit(Vec2::new(100.0, 0.0), start + Duration::from_millis(40));

        core.tick(start + Duration::from_millis(80));
        assert_eq!(core.velocity(), Vec2::new(100.0, 0.0));
        assert_eq!(core.phase(), DriverPhase::Driving);
    }

    #[test]
    fn test_smoothing_lags_step_change() {
        let mut core = DriverCore::new(params(100.0, 0.5, Duration::from_secs(3600)));
        let start = Instant::now();
        core.submit(Vec2::new(1000.0, 0.0), start);

        // Target step 10 px: smoothed 5, 7.5, 8.75, ...
        assert_eq!(core.tick(start), Some((5, 0)));
        assert_eq!(core.tick(start), Some((7, 0)));
        assert!((core.residual().x - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_submit_is_ignored() {
        let mut core = DriverCore::new(DriverParams::default());
        core.submit(Vec2::new(f64::NAN, 1.0), Instant::now());
        assert_eq!(core.velocity(), Vec2::ZERO);
    }

    #[test]
    fn test_driver_thread_moves_and_stops() {
        let recorder = RecordingActuator::new();
        let driver = ActuationDriver::new(
            params(1000.0, 1.0, Duration::from_secs(3600)),
            Box::new(recorder.clone()),
        );

        driver.start().unwrap();
        assert!(driver.is_running());
        driver.submit_vector(2000.0, 0.0);
        thread::sleep(Duration::from_millis(100));
        driver.stop();
        assert!(!driver.is_running());

        let moved = recorder.len();
        assert!(moved > 0);
        assert!(recorder.events().iter().all(|&(dx, dy)| dx > 0 && dy == 0));

        // Joined: nothing more after stop
        thread::sleep(Duration::from_millis(30));
        assert_eq!(recorder.len(), moved);
        assert_eq!(driver.velocity(), Vec2::ZERO);
    }

    #[test]
    fn test_stop_publishes_idle_telemetry() {
        let store = crate::state::StateStore::shared(crate::config::Config::default());
        let driver = ActuationDriver::with_telemetry(
            params(1000.0, 1.0, Duration::from_secs(3600)),
            Box::new(RecordingActuator::new()),
            &store,
        );

        driver.start().unwrap();
        driver.submit_vector(500.0, 0.0);
        let deadline = Instant::now() + Duration::from_secs(2);
        while store.driver.phase.get() != DriverPhase::Driving && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(store.driver.phase.get(), DriverPhase::Driving);

        driver.stop();
        assert_eq!(store.driver.phase.get(), DriverPhase::Idle);
        assert_eq!(store.driver.velocity.get(), Vec2::ZERO);
    }

    #[test]
    fn test_submit_vector_from_many_threads() {
        let driver = Arc::new(ActuationDriver::new(
            DriverParams::default(),
            Box::new(RecordingActuator::new()),
        ));
        driver.start().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let driver = Arc::clone(&driver);
                thread::spawn(move || {
                    for _ in 0..200 {
                        driver.submit_vector(i as f64 * 10.0, 5.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let v = driver.velocity();
        assert_eq!(v.y, 5.0);
        assert!([0.0, 10.0, 20.0, 30.0].contains(&v.x));
        driver.stop();
    }

    proptest! {
        #[test]
        fn prop_residual_conservation(
            vx in -3000.0f64..3000.0,
            vy in -3000.0f64..3000.0,
            n in 1u32..2000,
        ) {
            let rate = 1000.0;
            let mut core = DriverCore::new(params(rate, 1.0, Duration::from_secs(3600)));
            let start = Instant::now();
            core.submit(Vec2::new(vx, vy), start);

            let (ex, ey) = run_ticks(&mut core, start, n);

            let expected_x = vx * n as f64 / rate;
            let expected_y = vy * n as f64 / rate;
            prop_assert!((ex as f64 - expected_x).abs() <= 1.0);
            prop_assert!((ey as f64 - expected_y).abs() <= 1.0);
        }
    }
}
