//! Target selection.
//!
//! Scores every detection of a frame and picks one target. The score blends
//! three terms:
//!
//! - **direction**: cosine similarity to the previously chosen vector, mapped
//!   to [0, 1] (0.5 when there is no reference)
//! - **distance**: 1 minus the distance from frame center over half the frame
//!   diagonal, clamped to [0, 1]
//! - **confidence**: the detector's raw confidence
//!
//! With the default weights distance dominates, so the nearest plausible
//! target beats a far but well-aligned one.

use crate::config::{Config, SelectorWeights};
use crate::state::TargetState;
use crate::types::{ClassId, Detection, DetectionBatch, FrameSize, SelectedTarget, Vec2};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Filtering and scoring parameters for one selection
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionParams {
    pub min_confidence: f64,
    pub allowed_class_ids: Option<BTreeSet<ClassId>>,
    pub weights: SelectorWeights,
    pub switch_distance: f64,
    pub reference_hold_frames: u32,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SelectionParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_confidence: config.detector.min_confidence,
            allowed_class_ids: config.detector.allowed_class_ids.clone(),
            weights: config.selector.weights,
            switch_distance: config.selector.switch_distance,
            reference_hold_frames: config.selector.reference_hold_frames,
        }
    }

    fn accepts(&self, detection: &Detection) -> bool {
        detection.confidence >= self.min_confidence
            && self
                .allowed_class_ids
                .as_ref()
                .map_or(true, |allowed| allowed.contains(&detection.class_id))
    }
}

/// Score breakdown for one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    pub direction: f64,
    pub distance: f64,
    pub confidence: f64,
    pub total: f64,
}

/// Direction similarity between `v` and the reference, in [0, 1]
pub fn direction_score(v: Vec2, reference: Option<Vec2>) -> f64 {
    let Some(reference) = reference else {
        return 0.5;
    };
    let norms = v.length() * reference.length();
    if norms == 0.0 {
        return 0.5;
    }
    let cos = (v.dot(reference) / norms).clamp(-1.0, 1.0);
    (cos + 1.0) / 2.0
}

/// Closeness of `v` to the frame center, in [0, 1]
pub fn distance_score(v: Vec2, frame: FrameSize) -> f64 {
    let half_diagonal = frame.half_diagonal();
    if half_diagonal == 0.0 {
        return 0.0;
    }
    (1.0 - v.length() / half_diagonal).clamp(0.0, 1.0)
}

/// Score one candidate vector
pub fn score_candidate(
    v: Vec2,
    confidence: f64,
    reference: Option<Vec2>,
    frame: FrameSize,
    weights: &SelectorWeights,
) -> CandidateScore {
    let direction = direction_score(v, reference);
    let distance = distance_score(v, frame);
    let total = weights.direction * direction
        + weights.distance * distance
        + weights.confidence * confidence;
    CandidateScore {
        direction,
        distance,
        confidence,
        total,
    }
}

/// Pick the best detection of a batch.
///
/// Pure: returns the index into `batch.detections` and the chosen vector.
/// Ties go to the earliest candidate in input order.
pub fn pick_best(
    batch: &DetectionBatch,
    reference: Option<Vec2>,
    params: &SelectionParams,
) -> Option<(usize, Vec2, CandidateScore)> {
    let center = batch.frame_size.center();
    let mut best: Option<(usize, Vec2, CandidateScore)> = None;

    for (index, detection) in batch.detections.iter().enumerate() {
        if !params.accepts(detection) {
            continue;
        }
        let v = detection.bbox.center() - center;
        let score = score_candidate(
            v,
            detection.confidence,
            reference,
            batch.frame_size,
            &params.weights,
        );
        trace!(
            "candidate {} class {} v=({:.1}, {:.1}) score {:.4}",
            index,
            detection.class_id,
            v.x,
            v.y,
            score.total
        );

        // Strictly greater keeps the first of equal scores
        if best.map_or(true, |(_, _, b)| score.total > b.total) {
            best = Some((index, v, score));
        }
    }

    best
}

/// Stateful selector carrying the reference vector between frames
#[derive(Debug, Clone)]
pub struct TargetSelector {
    params: SelectionParams,
    reference: Option<Vec2>,
    /// Last published target, for identity tracking
    current: Option<SelectedTarget>,
    generation: u64,
    empty_frames: u32,
}

impl TargetSelector {
    pub fn new(params: SelectionParams) -> Self {
        Self {
            params,
            reference: None,
            current: None,
            generation: 0,
            empty_frames: 0,
        }
    }

    pub fn params(&self) -> &SelectionParams {
        &self.params
    }

    /// Replace filtering/scoring parameters; takes effect on the next batch
    pub fn set_params(&mut self, params: SelectionParams) {
        self.params = params;
    }

    pub fn reference(&self) -> Option<Vec2> {
        self.reference
    }

    pub fn set_reference(&mut self, reference: Option<Vec2>) {
        self.reference = reference;
    }

    pub fn current(&self) -> Option<SelectedTarget> {
        self.current
    }

    /// Select a target from `batch`, updating the reference vector
    pub fn select(&mut self, batch: &DetectionBatch) -> Option<SelectedTarget> {
        let Some((index, vector, score)) = pick_best(batch, self.reference, &self.params) else {
            self.on_empty();
            return None;
        };

        let detection = &batch.detections[index];
        self.empty_frames = 0;

        if self.is_new_identity(vector, detection.class_id) {
            self.generation += 1;
            debug!(
                "New target (generation {}): class {} at ({:.1}, {:.1})",
                self.generation, detection.class_id, vector.x, vector.y
            );
        }

        let target = SelectedTarget {
            vector,
            bbox: detection.bbox,
            confidence: detection.confidence,
            class_id: detection.class_id,
            generation: self.generation,
            frame_seq: batch.frame_seq,
        };

        trace!(
            "Selected candidate {} of {} (score {:.4})",
            index,
            batch.detections.len(),
            score.total
        );

        self.reference = Some(vector);
        self.current = Some(target);
        Some(target)
    }

    /// Select and publish into the target cells
    pub fn select_and_publish(
        &mut self,
        batch: &DetectionBatch,
        state: &TargetState,
    ) -> Option<SelectedTarget> {
        let target = self.select(batch);
        match target {
            Some(target) => state.publish(target),
            None => state.clear(),
        }
        target
    }

    fn is_new_identity(&self, vector: Vec2, class_id: ClassId) -> bool {
        match self.current {
            None => true,
            Some(previous) => {
                previous.class_id != class_id
                    || previous.vector.distance(vector) > self.params.switch_distance
            }
        }
    }

    fn on_empty(&mut self) {
        if self.current.take().is_some() {
            debug!("Target lost");
        }
        self.empty_frames = self.empty_frames.saturating_add(1);
        if self.reference.is_some() && self.empty_frames > self.params.reference_hold_frames {
            debug!(
                "Clearing reference vector after {} empty frames",
                self.empty_frames
            );
            self.reference = None;
        }
    }
}

impl Default for TargetSelector {
    fn default() -> Self {
        Self::new(SelectionParams::default())
    }
}
