//! Composition root for the detection-to-pointer pipeline.
//!
//! Owns the state store, the worker runtime, and every stage, and wires them
//! through the bus:
//!
//! ```text
//! capture.frame ─▶ DetectionStage ─▶ detection.batch ─▶ TargetSelector
//!   ─▶ target.selected ─▶ ControlStage ─▶ control.command ─▶ ActuationDriver
//! ```
//!
//! Detection and selection run on the worker pool behind skip-if-busy gates;
//! the controller step and the driver submit run inline.

use crate::actuator::Actuator;
use crate::config::Config;
use crate::control::ControlStage;
use crate::detection::{DetectionStage, Detector};
use crate::driver::{ActuationDriver, DriverParams, DriverPhase};
use crate::monitor::{CaptureMonitor, CaptureProvider, InputMonitor, InputSource};
use crate::offload::{Offload, SkipIfBusy};
use crate::selector::{SelectionParams, TargetSelector};
use crate::state::StateStore;
use crate::types::{DetectionBatch, FrameSeq, PipelineError, SelectedTarget, Vec2};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Ready,
    Running,
    Stopped,
}

/// Main pipeline
pub struct Pipeline {
    store: Arc<StateStore>,
    runtime: Option<Runtime>,
    offload: Offload,
    driver: Arc<ActuationDriver>,
    selector: Arc<Mutex<TargetSelector>>,
    selector_gate: SkipIfBusy,
    control: Arc<ControlStage>,
    detection: Option<Arc<DetectionStage>>,
    capture_provider: Option<Box<dyn CaptureProvider>>,
    input_source: Option<Box<dyn InputSource>>,
    capture_monitor: Option<CaptureMonitor>,
    input_monitor: Option<InputMonitor>,
    lifecycle: Lifecycle,
}

impl Pipeline {
    /// Build and wire the pipeline. Nothing runs until [`Pipeline::start`].
    pub fn new(config: Config, actuator: Box<dyn Actuator>) -> Result<Self, PipelineError> {
        config.validate()?;

        let threads = config.general.worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .max_blocking_threads(threads)
            .thread_name("pointer-pilot-worker")
            .enable_time()
            .build()
            .map_err(PipelineError::Runtime)?;
        let offload = Offload::new(runtime.handle().clone());

        let selector = Arc::new(Mutex::new(TargetSelector::new(SelectionParams::from_config(
            &config,
        ))));
        let driver_params = DriverParams::from_config(&config.driver);

        let store = StateStore::shared(config);
        let driver = Arc::new(ActuationDriver::with_telemetry(
            driver_params,
            actuator,
            &store,
        ));
        let control = ControlStage::new(&store);

        let pipeline = Self {
            store,
            runtime: Some(runtime),
            offload,
            driver,
            selector,
            selector_gate: SkipIfBusy::new(),
            control,
            detection: None,
            capture_provider: None,
            input_source: None,
            capture_monitor: None,
            input_monitor: None,
            lifecycle: Lifecycle::Ready,
        };
        pipeline.wire();
        Ok(pipeline)
    }

    fn wire(&self) {
        let store = Arc::downgrade(&self.store);
        let selector = Arc::clone(&self.selector);
        self.store.detection.batch.subscribe(self.offload.exclusive_subscriber(
            "selector",
            self.selector_gate.clone(),
            move |batch: Option<DetectionBatch>| {
                let (Some(batch), Some(store)) = (batch, store.upgrade()) else {
                    return;
                };
                selector
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .select_and_publish(&batch, &store.target);
            },
        ));

        self.control.attach();

        let driver = Arc::clone(&self.driver);
        self.store.control.command.subscribe(move |command| {
            driver.submit_vector(command.vector.x, command.vector.y);
        });

        let selector = Arc::clone(&self.selector);
        let driver = Arc::clone(&self.driver);
        self.store.config.subscribe(move |config| {
            selector
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set_params(SelectionParams::from_config(config));
            driver.update_params(DriverParams::from_config(&config.driver));
            debug!("Pipeline reconfigured");
        });
    }

    /// Capture frames from `provider` once started
    pub fn with_capture(mut self, provider: Box<dyn CaptureProvider>) -> Self {
        self.capture_provider = Some(provider);
        self
    }

    /// Run `detector` on every captured frame
    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        let stage = DetectionStage::new(&self.store, detector);
        stage.attach(&self.offload);
        self.detection = Some(stage);
        self
    }

    /// Poll `source` for activation and cursor state once started
    pub fn with_input(mut self, source: Box<dyn InputSource>) -> Self {
        self.input_source = Some(source);
        self
    }

    /// Start the driver loop and the monitors
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match self.lifecycle {
            Lifecycle::Running => return Err(PipelineError::AlreadyRunning),
            Lifecycle::Stopped => return Err(PipelineError::Stopped),
            Lifecycle::Ready => {}
        }

        self.driver.start()?;
        if let Some(source) = self.input_source.take() {
            self.input_monitor = Some(InputMonitor::start(Arc::clone(&self.store), source)?);
        }
        if let Some(provider) = self.capture_provider.take() {
            self.capture_monitor = Some(CaptureMonitor::start(Arc::clone(&self.store), provider)?);
        }

        self.lifecycle = Lifecycle::Running;
        info!("Pipeline started");
        Ok(())
    }

    /// Stop every loop and drain the worker pool. No motion follows this call.
    pub fn stop(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }

        if let Some(mut monitor) = self.capture_monitor.take() {
            monitor.stop();
        }
        if let Some(mut monitor) = self.input_monitor.take() {
            monitor.stop();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_millis(500));
        }
        self.driver.stop();

        self.lifecycle = Lifecycle::Stopped;
        info!("Pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    /// Whether a selection job is still running on the worker pool
    pub fn is_selecting(&self) -> bool {
        self.selector_gate.is_busy()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn driver(&self) -> &ActuationDriver {
        &self.driver
    }

    pub fn detection(&self) -> Option<&Arc<DetectionStage>> {
        self.detection.as_ref()
    }

    /// Validate and publish a new configuration; stages pick it up on their next cycle
    pub fn apply_config(&self, config: Config) -> Result<(), PipelineError> {
        config.validate()?;
        if self.store.config.set(config) {
            info!("Configuration updated");
        }
        Ok(())
    }

    /// Publish a detection batch as if the detection stage produced it
    pub fn publish_batch(&self, batch: DetectionBatch) -> bool {
        self.store.detection.batch.set(Some(batch))
    }

    /// Get pipeline status
    pub fn status(&self) -> PipelineStatus {
        let store = &self.store;
        PipelineStatus {
            running: self.is_running(),
            last_frame: store.capture.frame.get().map(|f| f.seq),
            capture_failures: store.capture.failures.get(),
            target: store.target.selected.get(),
            generation: store.target.generation.get(),
            commands_issued: self.control.commands_issued(),
            driver_phase: self.driver.phase(),
            driver_velocity: self.driver.velocity(),
            emitted_total: self.driver.emitted_total(),
            dropped_selections: self.selector_gate.dropped(),
            dropped_frames: self.detection.as_ref().map_or(0, |d| d.dropped_frames()),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Pipeline status information
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub running: bool,
    pub last_frame: Option<FrameSeq>,
    pub capture_failures: u64,
    pub target: Option<SelectedTarget>,
    pub generation: u64,
    pub commands_issued: u64,
    pub driver_phase: DriverPhase,
    pub driver_velocity: Vec2,
    pub emitted_total: (i64, i64),
    pub dropped_selections: u64,
    pub dropped_frames: u64,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "running:            {}", self.running)?;
        match self.last_frame {
            Some(seq) => writeln!(f, "last frame:         {}", seq)?,
            None => writeln!(f, "last frame:         none")?,
        }
        writeln!(f, "capture failures:   {}", self.capture_failures)?;
        match &self.target {
            Some(t) => writeln!(
                f,
                "target:             class {} at ({:.1}, {:.1}), confidence {:.2}",
                t.class_id, t.vector.x, t.vector.y, t.confidence
            )?,
            None => writeln!(f, "target:             none")?,
        }
        writeln!(f, "target generation:  {}", self.generation)?;
        writeln!(f, "commands issued:    {}", self.commands_issued)?;
        writeln!(
            f,
            "driver:             {:?} ({:.1}, {:.1}) px/s",
            self.driver_phase, self.driver_velocity.x, self.driver_velocity.y
        )?;
        writeln!(
            f,
            "emitted motion:     ({}, {})",
            self.emitted_total.0, self.emitted_total.1
        )?;
        write!(
            f,
            "dropped:            {} selections, {} frames",
            self.dropped_selections, self.dropped_frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::RecordingActuator;
    use crate::types::{BBox, Detection, FrameSize};
    use std::thread;
    use std::time::Instant;

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = Config::default();
        config.controller.adrc.k_eso = 10.0;
        let result = Pipeline::new(config, Box::new(RecordingActuator::new()));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_lifecycle() {
        let mut pipeline = Pipeline::new(Config::default(), Box::new(RecordingActuator::new())).unwrap();
        assert!(!pipeline.is_running());

        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyRunning)));
        assert!(pipeline.driver().is_running());

        pipeline.stop();
        assert!(!pipeline.driver().is_running());
        assert!(matches!(pipeline.start(), Err(PipelineError::Stopped)));
    }

    #[test]
    fn test_batch_flows_to_command() {
        let pipeline = Pipeline::new(Config::default(), Box::new(RecordingActuator::new())).unwrap();
        let frame = FrameSize::new(640, 480);
        let det = Detection::new(BBox::around(frame.center() + Vec2::new(40.0, 0.0), 20.0, 20.0), 0.9, 0);

        pipeline.publish_batch(DetectionBatch::new(1, frame, vec![det]));

        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.store().control.command.get().seq == 1
        }));
        let status = pipeline.status();
        assert_eq!(status.generation, 1);
        assert_eq!(status.commands_issued, 1);
        assert!(status.target.is_some());
        assert!(status.to_string().contains("class 0"));
    }

    #[test]
    fn test_apply_config_validates() {
        let pipeline = Pipeline::new(Config::default(), Box::new(RecordingActuator::new())).unwrap();

        let mut bad = Config::default();
        bad.driver.smoothing = 5.0;
        assert!(pipeline.apply_config(bad).is_err());

        let mut good = Config::default();
        good.driver.fps = 250;
        pipeline.apply_config(good).unwrap();
        assert_eq!(pipeline.store().config.get().driver.fps, 250);
    }
}
