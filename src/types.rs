//! Core types used throughout the pipeline.
//!
//! This module defines the geometry primitives, detector output, the chosen
//! target record, and the error types shared by every stage.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use std::time::Instant;

/// Identifier of a detector class
pub type ClassId = u32;

/// Monotonic sequence number of a captured frame
pub type FrameSeq = u64;

/// 2D vector in pixel space (or pixels/second for velocities)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn dot(&self, other: Vec2) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn distance(&self, other: Vec2) -> f64 {
        (*self - other).length()
    }

    /// Exactly zero on both axes
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Apply `f` to each component
    pub fn map(self, f: impl Fn(f64) -> f64) -> Self {
        Self::new(f(self.x), f(self.y))
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Vec2) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Vec2 {
    fn sub_assign(&mut self, rhs: Vec2) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Mul<f64> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: f64) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

impl From<(f64, f64)> for Vec2 {
    fn from((x, y): (f64, f64)) -> Self {
        Self::new(x, y)
    }
}

/// Axis-aligned bounding box `(x1, y1, x2, y2)` in frame pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub const fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box of the given size centered on a point
    pub fn around(center: Vec2, width: f64, height: f64) -> Self {
        Self::new(
            center.x - width / 2.0,
            center.y - height / 2.0,
            center.x + width / 2.0,
            center.y + height / 2.0,
        )
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).abs()
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).abs()
    }
}

/// Size of a captured frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    /// Half of the frame diagonal, the normalizer for distance scores
    pub fn half_diagonal(&self) -> f64 {
        (self.width as f64).hypot(self.height as f64) / 2.0
    }
}

/// Screen region handed to the capture provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    pub const fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Square region of side `size` centered on the screen
    pub fn centered(screen: FrameSize, size: u32) -> Self {
        let width = size.min(screen.width);
        let height = size.min(screen.height);
        Self {
            left: ((screen.width - width) / 2) as i32,
            top: ((screen.height - height) / 2) as i32,
            width,
            height,
        }
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }
}

/// One object reported by the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub class_id: ClassId,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f64, class_id: ClassId) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
        }
    }
}

/// All detections produced for one frame. Immutable once published.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    /// Sequence number of the frame these detections came from
    #[serde(default)]
    pub frame_seq: FrameSeq,
    pub frame_size: FrameSize,
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// When the source frame was captured (not serialized)
    #[serde(skip)]
    pub captured_at: Option<Instant>,
}

impl DetectionBatch {
    pub fn new(frame_seq: FrameSeq, frame_size: FrameSize, detections: Vec<Detection>) -> Self {
        Self {
            frame_seq,
            frame_size,
            detections,
            captured_at: None,
        }
    }

    /// Empty batch for a frame where sensing failed
    pub fn empty(frame_seq: FrameSeq, frame_size: FrameSize) -> Self {
        Self::new(frame_seq, frame_size, Vec::new())
    }

    pub fn with_captured_at(mut self, at: Instant) -> Self {
        self.captured_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Target chosen by the selector for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectedTarget {
    /// Offset of the target center from the frame center
    pub vector: Vec2,
    pub bbox: BBox,
    pub confidence: f64,
    pub class_id: ClassId,
    /// Incremented whenever the tracked identity changes
    pub generation: u64,
    /// Frame the selection was made on; each frame is a new observation
    pub frame_seq: FrameSeq,
}

/// Velocity command from the controller stage.
///
/// `seq` increments with every controller step, so a repeated vector is still
/// a new command and keeps the driver's `max_duration` window open.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriveCommand {
    /// Pixels per second
    pub vector: Vec2,
    pub seq: u64,
}

/// Raw input state reported by the input source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputSnapshot {
    /// Whether the activation key/button is held
    pub activation_held: bool,
    /// Absolute pointer position, if the source knows it
    pub cursor: Option<(i32, i32)>,
}

/// Errors from the capture provider
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture region is empty: {0:?}")]
    EmptyRegion(CaptureRegion),

    #[error("Capture backend unavailable: {0}")]
    Unavailable(String),

    #[error("Capture failed: {0}")]
    Failed(String),
}

/// Errors from the detector
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Detector model not loaded")]
    NotLoaded,

    #[error("Inference failed: {0}")]
    InferenceFailed(String),
}

/// Errors creating or driving an actuator device
#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("Actuator device unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from pipeline lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline already running")]
    AlreadyRunning,

    #[error("Pipeline was stopped and cannot be restarted")]
    Stopped,

    #[error("Failed to build worker runtime: {0}")]
    Runtime(std::io::Error),

    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),
}
