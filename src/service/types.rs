//! Service layer types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::engine::{Detection, ModelFamily};
use crate::media::{MediaKind, VideoInfo};

/// Detections and target count for one decoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FrameResult {
    pub frame_index: usize,
    pub detections: Vec<Detection>,
    pub target_count: usize,
}

/// Outcome of one analysis request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AnalysisResult {
    pub source: String,
    pub media_kind: MediaKind,
    pub target_label: String,
    pub min_confidence: f32,
    pub model: String,
    pub model_family: ModelFamily,
    pub total_frames: usize,
    pub frames: Vec<FrameResult>,
    pub aggregate_count: usize,
    /// Detections at or above `min_confidence` per label, across all frames
    pub class_summary: BTreeMap<String, usize>,
    /// False when the model's class set has no such label; the count is then 0
    pub target_label_known: bool,
    /// Stream geometry, present for video uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoInfo>,
    pub inference_time_ms: u64,
}

/// Caller-supplied knobs for an analysis. `None` means "use the default".
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub target_label: Option<String>,
    pub min_confidence: Option<f32>,
    pub model: Option<String>,
    pub max_frames: Option<usize>,
    pub source_name: Option<String>,
}

impl AnalysisRequest {
    pub fn for_label(label: &str) -> Self {
        Self {
            target_label: Some(label.to_string()),
            ..Default::default()
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: String,
    pub version: String,
    pub models: Vec<String>,
    pub video_supported: bool,
}

/// A loaded model as advertised by `/api/v1/models`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub family: ModelFamily,
    pub is_default: bool,
    pub num_classes: usize,
    pub labels: Vec<String>,
}
