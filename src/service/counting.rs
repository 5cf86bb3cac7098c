//! Counting Aggregator
//!
//! Filters detections by target label and confidence and folds per-frame
//! counts into a request total.

use std::collections::BTreeMap;

use tracing::warn;

use crate::engine::Detection;
pub use crate::engine::labels::normalize_label;

use super::types::FrameResult;

/// Detections of `target_label` scoring at least `min_confidence`.
///
/// A label the model never emits simply counts 0.
pub fn count(detections: &[Detection], target_label: &str, min_confidence: f32) -> usize {
    let target = normalize_label(target_label);
    detections
        .iter()
        .filter(|d| d.confidence >= min_confidence && normalize_label(&d.label) == target)
        .count()
}

/// Per-label counts of detections scoring at least `min_confidence`
pub fn summarize(detections: &[Detection], min_confidence: f32) -> BTreeMap<String, usize> {
    let mut summary = BTreeMap::new();
    for detection in detections.iter().filter(|d| d.confidence >= min_confidence) {
        *summary.entry(detection.label.clone()).or_insert(0) += 1;
    }
    summary
}

/// Pick the threshold for a request.
///
/// Values outside `(0, 1]` or non-finite fall back to `default`.
pub fn resolve_confidence(requested: Option<f32>, default: f32) -> f32 {
    match requested {
        None => default,
        Some(value) if value.is_finite() && value > 0.0 && value <= 1.0 => value,
        Some(value) => {
            warn!("Confidence {} out of range (0, 1], using {}", value, default);
            default
        }
    }
}

/// Builds the frame list of an analysis one frame at a time.
///
/// Frame indices are assigned here, so they are always contiguous from 0 and
/// the aggregate always equals the sum of the per-frame counts.
#[derive(Debug)]
pub struct FrameAccumulator {
    target_label: String,
    min_confidence: f32,
    frames: Vec<FrameResult>,
    aggregate: usize,
    summary: BTreeMap<String, usize>,
}

impl FrameAccumulator {
    pub fn new(target_label: &str, min_confidence: f32) -> Self {
        Self {
            target_label: target_label.to_string(),
            min_confidence,
            frames: Vec::new(),
            aggregate: 0,
            summary: BTreeMap::new(),
        }
    }

    /// Record the next frame. Detections below the threshold are dropped and
    /// the rest ordered by descending confidence.
    pub fn push(&mut self, mut detections: Vec<Detection>) -> &FrameResult {
        detections.retain(|d| d.confidence >= self.min_confidence);
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let target_count = count(&detections, &self.target_label, self.min_confidence);
        for (label, n) in summarize(&detections, self.min_confidence) {
            *self.summary.entry(label).or_insert(0) += n;
        }
        self.aggregate += target_count;

        let frame_index = self.frames.len();
        self.frames.push(FrameResult {
            frame_index,
            detections,
            target_count,
        });
        &self.frames[frame_index]
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregate
    }

    /// Frames, aggregate count and class summary
    pub fn into_parts(self) -> (Vec<FrameResult>, usize, BTreeMap<String, usize>) {
        (self.frames, self.aggregate, self.summary)
    }
}
