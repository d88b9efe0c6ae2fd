//! Capture and input monitors.
//!
//! Both monitors are polling loops on their own threads that push what they
//! observe onto the bus. They read their section of the live config every
//! cycle, so interval and region changes apply on the next tick.

use crate::state::StateStore;
use crate::types::{CaptureError, CaptureRegion, FrameSeq, InputSnapshot, PipelineError};
use crate::worker::LoopThread;
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One captured frame as published on the bus
#[derive(Clone)]
pub struct CapturedFrame {
    pub seq: FrameSeq,
    pub region: CaptureRegion,
    pub captured_at: Instant,
    pub image: Arc<DynamicImage>,
}

impl CapturedFrame {
    pub fn new(seq: FrameSeq, region: CaptureRegion, image: DynamicImage) -> Self {
        Self {
            seq,
            region,
            captured_at: Instant::now(),
            image: Arc::new(image),
        }
    }
}

// Frames are identified by sequence number and region; pixels are not compared.
impl PartialEq for CapturedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.region == other.region
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("seq", &self.seq)
            .field("region", &self.region)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

/// Screen capture backend
pub trait CaptureProvider: Send {
    fn capture(&mut self, region: CaptureRegion) -> Result<DynamicImage, CaptureError>;
}

impl<F> CaptureProvider for F
where
    F: FnMut(CaptureRegion) -> Result<DynamicImage, CaptureError> + Send,
{
    fn capture(&mut self, region: CaptureRegion) -> Result<DynamicImage, CaptureError> {
        self(region)
    }
}

/// Raw keyboard/pointer state backend
pub trait InputSource: Send {
    fn poll(&mut self) -> InputSnapshot;
}

impl<F> InputSource for F
where
    F: FnMut() -> InputSnapshot + Send,
{
    fn poll(&mut self) -> InputSnapshot {
        self()
    }
}

/// Capture loop state, separate from the thread so it can be stepped directly
pub struct CaptureCycle {
    store: Arc<StateStore>,
    provider: Box<dyn CaptureProvider>,
    seq: FrameSeq,
}

impl CaptureCycle {
    pub fn new(store: Arc<StateStore>, provider: Box<dyn CaptureProvider>) -> Self {
        Self {
            store,
            provider,
            seq: 0,
        }
    }

    /// Capture one frame and publish it. Returns the delay to the next cycle.
    pub fn run_once(&mut self) -> Duration {
        let config = self.store.config.get();
        let region = CaptureRegion::centered(config.general.screen_size, config.capture.region_size);
        if self.store.capture.region.set(region) {
            debug!("Capture region now {:?}", region);
        }

        let result = if region.width == 0 || region.height == 0 {
            Err(CaptureError::EmptyRegion(region))
        } else {
            self.provider.capture(region)
        };

        match result {
            Ok(image) => {
                self.seq += 1;
                self.store
                    .capture
                    .frame
                    .set(Some(CapturedFrame::new(self.seq, region, image)));
            }
            Err(e) => {
                let failures = self.store.capture.failures.get() + 1;
                self.store.capture.failures.set(failures);
                // Only the first failure of a streak is worth a warning
                if self.store.capture.frame.set(None) {
                    warn!("Capture failed: {}", e);
                } else {
                    debug!("Capture failed ({} total): {}", failures, e);
                }
            }
        }

        config.capture.interval()
    }

    pub fn frames_captured(&self) -> FrameSeq {
        self.seq
    }
}

/// Background capture loop
pub struct CaptureMonitor {
    worker: LoopThread,
}

impl CaptureMonitor {
    pub fn start(
        store: Arc<StateStore>,
        provider: Box<dyn CaptureProvider>,
    ) -> Result<Self, PipelineError> {
        let mut cycle = CaptureCycle::new(store, provider);
        let worker = LoopThread::spawn("capture-monitor", move || cycle.run_once())?;
        info!("Capture monitor started");
        Ok(Self { worker })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) {
        self.worker.stop();
    }
}

/// Input polling loop state
pub struct InputCycle {
    store: Arc<StateStore>,
    source: Box<dyn InputSource>,
}

impl InputCycle {
    pub fn new(store: Arc<StateStore>, source: Box<dyn InputSource>) -> Self {
        Self { store, source }
    }

    pub fn run_once(&mut self) -> Duration {
        let snapshot = self.source.poll();
        let input = &self.store.input;

        if input.activation_held.set(snapshot.activation_held) {
            debug!("Activation held: {}", snapshot.activation_held);
        }
        input.cursor.set(snapshot.cursor);

        self.store.config.get().input.poll_interval()
    }
}

/// Background input polling loop
pub struct InputMonitor {
    worker: LoopThread,
}

impl InputMonitor {
    pub fn start(store: Arc<StateStore>, source: Box<dyn InputSource>) -> Result<Self, PipelineError> {
        let mut cycle = InputCycle::new(store, source);
        let worker = LoopThread::spawn("input-monitor", move || cycle.run_once())?;
        info!("Input monitor started");
        Ok(Self { worker })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) {
        self.worker.stop();
    }
}
