//! End-to-end tests for the assembled pipeline.
//!
//! These run the real worker pool and driver thread, so every check waits on
//! the bus with a timeout instead of assuming a schedule.

use image::DynamicImage;
use pointer_pilot::{
    BBox, CaptureError, CaptureRegion, ClassId, Config, ControllerKind, Detection,
    DetectionBatch, Detector, DetectorError, DriverPhase, FrameSize, InputSnapshot, Pipeline,
    RecordingActuator, Vec2,
};
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(3);

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn proportional_config(kp: f64) -> Config {
    let mut config = Config::default();
    config.detector.allowed_class_ids = Some([0].into_iter().collect());
    config.controller.kind = ControllerKind::Pid;
    config.controller.pid.kp = kp;
    config.controller.pid.ki = 0.0;
    config.controller.pid.kd = 0.0;
    config
}

fn batch_with_offset(seq: u64, offset: Vec2, confidence: f64, class_id: ClassId) -> DetectionBatch {
    let frame = FrameSize::new(640, 480);
    let bbox = BBox::around(frame.center() + offset, 20.0, 20.0);
    DetectionBatch::new(seq, frame, vec![Detection::new(bbox, confidence, class_id)])
}

fn wait_for_command(pipeline: &Pipeline, seq: u64) -> bool {
    wait_for(|| pipeline.store().control.command.get().seq >= seq && !pipeline.is_selecting())
}

#[test]
fn test_single_candidate_proportional_command() {
    let pipeline = Pipeline::new(proportional_config(1.0), Box::new(RecordingActuator::new())).unwrap();

    pipeline.publish_batch(batch_with_offset(1, Vec2::new(50.0, 0.0), 0.8, 0));

    assert!(wait_for_command(&pipeline, 1));
    assert_eq!(pipeline.store().control.command.get().vector, Vec2::new(50.0, 0.0));
    assert_eq!(pipeline.store().target.vector.get(), Some(Vec2::new(50.0, 0.0)));
    assert_eq!(pipeline.store().target.class_id.get(), Some(0));
}

#[test]
fn test_disallowed_class_produces_no_command() {
    let pipeline = Pipeline::new(proportional_config(1.0), Box::new(RecordingActuator::new())).unwrap();

    pipeline.publish_batch(batch_with_offset(1, Vec2::new(50.0, 0.0), 0.8, 3));

    assert!(wait_for(|| !pipeline.is_selecting()));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(pipeline.status().commands_issued, 0);
    assert!(pipeline.store().target.selected.get().is_none());
}

#[test]
fn test_runtime_config_change_applies_to_next_sample() {
    let pipeline = Pipeline::new(proportional_config(1.0), Box::new(RecordingActuator::new())).unwrap();

    pipeline.publish_batch(batch_with_offset(1, Vec2::new(50.0, 0.0), 0.8, 0));
    assert!(wait_for_command(&pipeline, 1));

    pipeline.apply_config(proportional_config(2.0)).unwrap();
    pipeline.publish_batch(batch_with_offset(2, Vec2::new(50.0, 0.0), 0.8, 0));

    assert!(wait_for_command(&pipeline, 2));
    assert_eq!(pipeline.store().control.command.get().vector, Vec2::new(100.0, 0.0));
}

#[test]
fn test_driver_moves_then_decays_after_target_loss() {
    let recorder = RecordingActuator::new();
    let mut pipeline = Pipeline::new(proportional_config(4.0), Box::new(recorder.clone())).unwrap();
    pipeline.start().unwrap();

    pipeline.publish_batch(batch_with_offset(1, Vec2::new(100.0, 0.0), 0.9, 0));
    assert!(wait_for_command(&pipeline, 1));
    assert!(wait_for(|| recorder.total().0 > 0));

    pipeline.publish_batch(DetectionBatch::empty(2, FrameSize::new(640, 480)));
    assert!(wait_for(|| pipeline.store().target.selected.get().is_none()));
    assert!(wait_for(|| pipeline.driver().phase() == DriverPhase::Idle));
    assert_eq!(pipeline.driver().velocity(), Vec2::ZERO);

    pipeline.stop();
    let moves = recorder.len();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(recorder.len(), moves);
    assert!(recorder.events().iter().all(|&(dx, dy)| dx >= 0 && dy == 0));
}

/// Reports one detection `offset` pixels from the center of every image
struct OffsetDetector {
    offset: Vec2,
}

impl Detector for OffsetDetector {
    fn infer(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, DetectorError> {
        let center = FrameSize::new(image.width(), image.height()).center();
        Ok(vec![Detection::new(
            BBox::around(center + self.offset, 8.0, 8.0),
            0.9,
            0,
        )])
    }

    fn class_names(&self) -> BTreeMap<ClassId, String> {
        BTreeMap::from([(0, "target".to_string())])
    }
}

#[test]
fn test_capture_detect_actuate_flow() {
    let mut config = proportional_config(6.0);
    config.capture.region_size = 64;

    let recorder = RecordingActuator::new();
    let mut pipeline = Pipeline::new(config, Box::new(recorder.clone()))
        .unwrap()
        .with_capture(Box::new(|region: CaptureRegion| {
            Ok::<_, CaptureError>(DynamicImage::new_rgb8(region.width, region.height))
        }))
        .with_detector(Box::new(OffsetDetector {
            offset: Vec2::new(20.0, 0.0),
        }))
        .with_input(Box::new(|| InputSnapshot {
            activation_held: true,
            cursor: None,
        }));

    assert_eq!(
        pipeline.store().detection.class_names.get().get(&0).map(String::as_str),
        Some("target")
    );

    pipeline.start().unwrap();
    assert!(wait_for(|| recorder.total().0 >= 3));
    pipeline.stop();

    let status = pipeline.status();
    assert!(status.last_frame.unwrap_or(0) > 0);
    assert_eq!(status.capture_failures, 0);
    assert_eq!(status.generation, 1);
    assert!(pipeline.store().input.activation_held.get());
    assert!(recorder.events().iter().all(|&(dx, dy)| dx > 0 && dy == 0));
}
