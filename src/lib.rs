//! Pointer Pilot - detection-to-pointer control pipeline
//!
//! This crate turns a stream of detected on-screen objects into smooth,
//! time-bounded relative pointer motion:
//!
//! - **Bus**: [`ValueCell`]s hold the latest value of each field and notify
//!   subscribers on change
//! - **Selection**: scores every detection and picks one target per frame
//! - **Control**: PID or linear ADRC turns the target offset into a velocity
//! - **Actuation**: a fixed-rate driver loop converts velocity into integer
//!   steps with sub-pixel residuals and time-bounded decay
//!
//! # Architecture
//!
//! Every stage publishes into a cell of the shared [`StateStore`] and
//! subscribes to the cell of the stage before it. Capture, input polling and
//! the driver loop run on their own threads; detection and selection are
//! offloaded to a worker pool and drop work instead of queueing it.

pub mod actuator;
pub mod cell;
pub mod config;
pub mod control;
pub mod controller;
pub mod detection;
pub mod driver;
pub mod monitor;
pub mod offload;
pub mod pipeline;
pub mod selector;
pub mod state;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use actuator::{Actuator, LogActuator, RecordingActuator};
#[cfg(target_os = "linux")]
pub use actuator::VirtualMouse;
pub use cell::{SubscriptionHandle, ValueCell};
pub use config::{Config, ConfigError, ControllerKind};
pub use control::ControlStage;
pub use controller::{build_controller, AdrcController, Controller, PidController};
pub use detection::{DetectionStage, Detector};
pub use driver::{ActuationDriver, DriverCore, DriverParams, DriverPhase};
pub use monitor::{CaptureMonitor, CaptureProvider, CapturedFrame, InputMonitor, InputSource};
pub use offload::{Offload, SkipIfBusy};
pub use pipeline::{Pipeline, PipelineStatus};
pub use selector::{SelectionParams, TargetSelector};
pub use state::StateStore;
pub use types::{
    ActuatorError, BBox, CaptureError, CaptureRegion, ClassId, Detection, DetectionBatch,
    DetectorError, DriveCommand, FrameSeq, FrameSize, InputSnapshot, PipelineError,
    SelectedTarget, Vec2,
};
pub use worker::LoopThread;
