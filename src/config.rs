//! Configuration management for the pipeline.
//!
//! Loads configuration from TOML files and provides runtime defaults. A loaded
//! [`Config`] is published into the store's config cell; every stage reads its
//! section from there on its next cycle, so changes need no restart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::types::{ClassId, FrameSize};

/// Errors from loading, saving, or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Screen size used to center the capture region
    #[serde(default = "default_screen_size")]
    pub screen_size: FrameSize,

    /// Worker threads for offloaded subscribers
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            screen_size: default_screen_size(),
            worker_threads: default_worker_threads(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Side of the square region captured around the screen center
    #[serde(default = "default_region_size")]
    pub region_size: u32,

    /// Time between captures
    #[serde(default = "default_capture_interval")]
    pub interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            region_size: default_region_size(),
            interval_ms: default_capture_interval(),
        }
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Detections below this confidence are ignored
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Only these classes are considered; `None` allows every class
    #[serde(default)]
    pub allowed_class_ids: Option<BTreeSet<ClassId>>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            allowed_class_ids: None,
        }
    }
}

/// Weights of the three selector score terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectorWeights {
    #[serde(default = "default_weight_direction")]
    pub direction: f64,
    #[serde(default = "default_weight_distance")]
    pub distance: f64,
    #[serde(default = "default_weight_confidence")]
    pub confidence: f64,
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            direction: default_weight_direction(),
            distance: default_weight_distance(),
            confidence: default_weight_confidence(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub weights: SelectorWeights,

    /// A jump larger than this (pixels) between frames counts as a new target
    #[serde(default = "default_switch_distance")]
    pub switch_distance: f64,

    /// Consecutive empty frames before the reference vector is forgotten
    #[serde(default = "default_reference_hold_frames")]
    pub reference_hold_frames: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: SelectorWeights::default(),
            switch_distance: default_switch_distance(),
            reference_hold_frames: default_reference_hold_frames(),
        }
    }
}

/// Which control law drives the command vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Pid,
    Adrc,
}

impl ControllerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerKind::Pid => "pid",
            ControllerKind::Adrc => "adrc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidParams {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    /// Output clamp, pixels per second
    #[serde(default = "default_v_limit")]
    pub v_limit: f64,
    /// Clamp on the accumulated integral (anti-windup)
    #[serde(default = "default_integral_limit")]
    pub integral_limit: f64,
}

impl Default for PidParams {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: 0.0,
            kd: 0.0,
            v_limit: default_v_limit(),
            integral_limit: default_integral_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdrcParams {
    /// 1 (position) or 2 (position + velocity)
    #[serde(default = "default_adrc_order")]
    pub order: u8,
    /// Seconds between calls; must match the real call cadence
    #[serde(default = "default_sample_time")]
    pub sample_time: f64,
    /// Estimated system gain
    #[serde(default = "default_b0")]
    pub b0: f64,
    /// Closed-loop bandwidth, rad/s
    #[serde(default = "default_w_cl")]
    pub w_cl: f64,
    /// Observer bandwidth as a multiple of `w_cl`
    #[serde(default = "default_k_eso")]
    pub k_eso: f64,
    /// Optional output magnitude limit
    #[serde(default)]
    pub output_limit: Option<f64>,
    /// Optional output rate limit, units per second
    #[serde(default)]
    pub rate_limit: Option<f64>,
}

impl Default for AdrcParams {
    fn default() -> Self {
        Self {
            order: default_adrc_order(),
            sample_time: default_sample_time(),
            b0: default_b0(),
            w_cl: default_w_cl(),
            k_eso: default_k_eso(),
            output_limit: Some(default_v_limit()),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub kind: ControllerKind,

    #[serde(default)]
    pub pid: PidParams,

    #[serde(default)]
    pub adrc: AdrcParams,

    /// Reset the controller when no sample arrived for this long
    #[serde(default = "default_idle_reset")]
    pub idle_reset_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kind: ControllerKind::default(),
            pid: PidParams::default(),
            adrc: AdrcParams::default(),
            idle_reset_ms: default_idle_reset(),
        }
    }
}

impl ControllerConfig {
    pub fn idle_reset(&self) -> Duration {
        Duration::from_millis(self.idle_reset_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Tick rate of the actuation loop
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Exponential smoothing factor in (0, 1]; smaller is smoother
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,

    /// How long a submitted vector is honored before decay starts
    #[serde(default = "default_max_duration")]
    pub max_duration_ms: u64,

    /// Per-tick velocity multiplier while decaying, in [0, 1)
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    /// Speed (units/second) under which a decaying velocity snaps to zero
    #[serde(default = "default_stop_threshold")]
    pub stop_threshold: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            smoothing: default_smoothing(),
            max_duration_ms: default_max_duration(),
            decay_rate: default_decay_rate(),
            stop_threshold: default_stop_threshold(),
        }
    }
}

impl DriverConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Only drive the pointer while the activation input is held
    #[serde(default)]
    pub require_activation: bool,

    /// Time between input polls
    #[serde(default = "default_input_poll")]
    pub poll_interval_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            require_activation: false,
            poll_interval_ms: default_input_poll(),
        }
    }
}

impl InputConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// Default value functions for serde
fn default_log_level() -> String {
    "info".to_string()
}

fn default_screen_size() -> FrameSize {
    FrameSize::new(1920, 1080)
}

fn default_worker_threads() -> usize {
    2
}

fn default_region_size() -> u32 {
    640
}

fn default_capture_interval() -> u64 {
    8
}

fn default_min_confidence() -> f64 {
    0.4
}

fn default_weight_direction() -> f64 {
    0.1
}

fn default_weight_distance() -> f64 {
    0.8
}

fn default_weight_confidence() -> f64 {
    0.1
}

fn default_switch_distance() -> f64 {
    80.0
}

fn default_reference_hold_frames() -> u32 {
    3
}

fn default_kp() -> f64 {
    6.0
}

fn default_v_limit() -> f64 {
    4000.0
}

fn default_integral_limit() -> f64 {
    500.0
}

fn default_adrc_order() -> u8 {
    1
}

fn default_sample_time() -> f64 {
    0.008
}

fn default_b0() -> f64 {
    1.0
}

fn default_w_cl() -> f64 {
    8.0
}

fn default_k_eso() -> f64 {
    2.5
}

fn default_idle_reset() -> u64 {
    250
}

fn default_fps() -> u32 {
    1000
}

fn default_smoothing() -> f64 {
    0.35
}

fn default_max_duration() -> u64 {
    50
}

fn default_decay_rate() -> f64 {
    0.9
}

fn default_stop_threshold() -> f64 {
    1.0
}

fn default_input_poll() -> u64 {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path(path: PathBuf) -> Self {
        match Self::try_load(&path) {
            Ok(config) => {
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(ConfigError::Io(_)) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
            Err(e) => {
                warn!("Failed to load config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load and validate configuration, reporting every failure
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pointer-pilot")
            .join("config.toml")
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to_path(Self::default_config_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Check value ranges the stages rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.screen_size.width == 0 || self.general.screen_size.height == 0 {
            return Err(invalid("general.screen_size", "must be non-zero"));
        }
        if self.capture.region_size == 0 {
            return Err(invalid("capture.region_size", "must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(invalid("detector.min_confidence", "must be in [0, 1]"));
        }

        let w = &self.selector.weights;
        if [w.direction, w.distance, w.confidence]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(invalid("selector.weights", "must be finite and non-negative"));
        }
        if w.distance < w.direction || w.distance < w.confidence {
            warn!(
                "selector.weights: distance ({}) no longer dominates; far aligned targets may win",
                w.distance
            );
        }

        let pid = &self.controller.pid;
        if !(pid.v_limit > 0.0) {
            return Err(invalid("controller.pid.v_limit", "must be positive"));
        }
        if !(pid.integral_limit >= 0.0) {
            return Err(invalid("controller.pid.integral_limit", "must be non-negative"));
        }

        let adrc = &self.controller.adrc;
        if adrc.order != 1 && adrc.order != 2 {
            return Err(invalid("controller.adrc.order", "must be 1 or 2"));
        }
        if !(adrc.sample_time > 0.0 && adrc.sample_time.is_finite()) {
            return Err(invalid("controller.adrc.sample_time", "must be positive"));
        }
        if adrc.b0 == 0.0 || !adrc.b0.is_finite() {
            return Err(invalid("controller.adrc.b0", "must be finite and non-zero"));
        }
        if !(adrc.w_cl > 0.0 && adrc.w_cl.is_finite()) {
            return Err(invalid("controller.adrc.w_cl", "must be positive"));
        }
        if !(adrc.k_eso > 0.0 && adrc.k_eso <= 4.0) {
            return Err(invalid("controller.adrc.k_eso", "must be in (0, 4]"));
        }
        if adrc.output_limit.is_some_and(|l| !(l > 0.0)) {
            return Err(invalid("controller.adrc.output_limit", "must be positive"));
        }
        if adrc.rate_limit.is_some_and(|l| !(l > 0.0)) {
            return Err(invalid("controller.adrc.rate_limit", "must be positive"));
        }

        let driver = &self.driver;
        if driver.fps == 0 {
            return Err(invalid("driver.fps", "must be positive"));
        }
        if !(driver.smoothing > 0.0 && driver.smoothing <= 1.0) {
            return Err(invalid("driver.smoothing", "must be in (0, 1]"));
        }
        if !(0.0..1.0).contains(&driver.decay_rate) {
            return Err(invalid("driver.decay_rate", "must be in [0, 1)"));
        }
        if !(driver.stop_threshold > 0.0) {
            return Err(invalid("driver.stop_threshold", "must be positive"));
        }

        Ok(())
    }
}
