//! Detection stage: runs the detector on every published frame.
//!
//! Inference is slow, so the stage subscribes to the frame cell through an
//! exclusive offloaded subscriber. A frame that arrives while the previous one
//! is still being processed is dropped. Failed captures and failed inference
//! both publish an empty batch, which the selector treats as "no target".

use crate::monitor::CapturedFrame;
use crate::offload::{Offload, SkipIfBusy};
use crate::state::StateStore;
use crate::types::{ClassId, Detection, DetectionBatch, DetectorError, FrameSeq, FrameSize};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Object detector model
pub trait Detector: Send {
    fn infer(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, DetectorError>;

    /// Class taxonomy of the loaded model
    fn class_names(&self) -> BTreeMap<ClassId, String>;
}

struct StageInner {
    detector: Box<dyn Detector>,
    last_seq: FrameSeq,
    last_size: FrameSize,
}

/// Frame → detections glue
pub struct DetectionStage {
    inner: Mutex<StageInner>,
    store: Weak<StateStore>,
    gate: SkipIfBusy,
}

impl DetectionStage {
    pub fn new(store: &Arc<StateStore>, detector: Box<dyn Detector>) -> Arc<Self> {
        let stage = Arc::new(Self {
            inner: Mutex::new(StageInner {
                detector,
                last_seq: 0,
                last_size: FrameSize::default(),
            }),
            store: Arc::downgrade(store),
            gate: SkipIfBusy::new(),
        });
        stage.publish_class_names();
        stage
    }

    /// Subscribe to the frame cell, running inference on the worker pool
    pub fn attach(self: &Arc<Self>, offload: &Offload) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let stage = Arc::clone(self);
        store.capture.frame.subscribe(offload.exclusive_subscriber(
            "detection",
            self.gate.clone(),
            move |frame: Option<CapturedFrame>| {
                stage.process_frame(frame.as_ref());
            },
        ));
    }

    /// Run the detector on `frame` and publish the batch
    pub fn process_frame(&self, frame: Option<&CapturedFrame>) -> DetectionBatch {
        let batch = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match frame {
                Some(frame) => {
                    inner.last_seq = frame.seq;
                    inner.last_size = frame.region.size();
                    let detections = match inner.detector.infer(&frame.image) {
                        Ok(detections) => detections,
                        Err(e) => {
                            warn!("Detection failed on frame {}: {}", frame.seq, e);
                            Vec::new()
                        }
                    };
                    DetectionBatch::new(frame.seq, frame.region.size(), detections)
                        .with_captured_at(frame.captured_at)
                }
                None => DetectionBatch::empty(inner.last_seq, inner.last_size),
            }
        };

        if let Some(store) = self.store.upgrade() {
            store.detection.batch.set(Some(batch.clone()));
        }
        batch
    }

    /// Swap in a new detector and publish its class taxonomy
    pub fn reload(&self, detector: Box<dyn Detector>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detector = detector;
        info!("Detector reloaded");
        self.publish_class_names();
    }

    fn publish_class_names(&self) {
        let names = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detector
            .class_names();
        debug!("Detector classes: {:?}", names);
        if let Some(store) = self.store.upgrade() {
            store.detection.class_names.set(names);
        }
    }

    /// Frames dropped because inference was still busy
    pub fn dropped_frames(&self) -> u64 {
        self.gate.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, CaptureRegion};

    struct FakeDetector {
        output: Result<Vec<Detection>, ()>,
        names: Vec<&'static str>,
    }

    impl Detector for FakeDetector {
        fn infer(&mut self, _image: &DynamicImage) -> Result<Vec<Detection>, DetectorError> {
            self.output
                .clone()
                .map_err(|_| DetectorError::InferenceFailed("model error".into()))
        }

        fn class_names(&self) -> BTreeMap<ClassId, String> {
            self.names
                .iter()
                .enumerate()
                .map(|(i, n)| (i as ClassId, n.to_string()))
                .collect()
        }
    }

    fn frame(seq: FrameSeq) -> CapturedFrame {
        let region = CaptureRegion::new(0, 0, 64, 48);
        CapturedFrame::new(seq, region, DynamicImage::new_rgb8(64, 48))
    }

    fn one_detection() -> Vec<Detection> {
        vec![Detection::new(BBox::new(10.0, 10.0, 20.0, 20.0), 0.9, 0)]
    }

    #[test]
    fn test_process_frame_publishes_batch() {
        let store = StateStore::shared(Default::default());
        let stage = DetectionStage::new(
            &store,
            Box::new(FakeDetector {
                output: Ok(one_detection()),
                names: vec!["person"],
            }),
        );

        let batch = stage.process_frame(Some(&frame(3)));

        assert_eq!(batch.frame_seq, 3);
        assert_eq!(batch.frame_size, FrameSize::new(64, 48));
        assert_eq!(batch.detections.len(), 1);
        assert!(batch.captured_at.is_some());
        assert_eq!(store.detection.batch.get(), Some(batch));
        assert_eq!(store.detection.class_names.get().get(&0).map(String::as_str), Some("person"));
    }

    #[test]
    fn test_inference_failure_publishes_empty_batch() {
        let store = StateStore::shared(Default::default());
        let stage = DetectionStage::new(
            &store,
            Box::new(FakeDetector {
                output: Err(()),
                names: vec![],
            }),
        );

        let batch = stage.process_frame(Some(&frame(1)));
        assert!(batch.is_empty());
        assert_eq!(batch.frame_seq, 1);
    }

    #[test]
    fn test_missing_frame_publishes_empty_batch() {
        let store = StateStore::shared(Default::default());
        let stage = DetectionStage::new(
            &store,
            Box::new(FakeDetector {
                output: Ok(one_detection()),
                names: vec![],
            }),
        );

        stage.process_frame(Some(&frame(5)));
        let batch = stage.process_frame(None);

        assert!(batch.is_empty());
        assert_eq!(batch.frame_seq, 5);
        assert_eq!(batch.frame_size, FrameSize::new(64, 48));
    }

    #[test]
    fn test_reload_publishes_class_names() {
        let store = StateStore::shared(Default::default());
        let stage = DetectionStage::new(
            &store,
            Box::new(FakeDetector {
                output: Ok(vec![]),
                names: vec!["a"],
            }),
        );
        assert_eq!(store.detection.class_names.get().len(), 1);

        stage.reload(Box::new(FakeDetector {
            output: Ok(vec![]),
            names: vec!["a", "b", "c"],
        }));
        assert_eq!(store.detection.class_names.get().len(), 3);
    }
}
