//! REST API request/response data transfer objects

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::engine::ModelFamily;

/// Multipart form accepted by the analyze and annotate endpoints
#[derive(Debug, ToSchema)]
pub struct AnalyzeForm {
    /// Image or video bytes. `image` is accepted as an alias.
    #[schema(value_type = Option<String>, format = Binary)]
    pub file: Option<Vec<u8>>,
    /// http(s) URL to fetch the media from instead of uploading it.
    /// `video_url` is accepted as an alias.
    pub url: Option<String>,
    /// Label to count, e.g. `person`. `target` is accepted as an alias.
    pub target_label: String,
    /// Threshold in (0, 1]; out of range values fall back to the default
    pub min_confidence: Option<f32>,
    /// Model name from `/api/v1/models`; defaults to the first one
    pub model: Option<String>,
    /// Frame cap for video uploads
    pub max_frames: Option<usize>,
}

/// Root banner
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub models: Vec<String>,
    pub video_supported: bool,
    pub uptime_seconds: u64,
}

/// Models response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModelsResponse {
    pub default_model: String,
    pub models: Vec<ModelDto>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModelDto {
    pub name: String,
    pub family: ModelFamily,
    pub is_default: bool,
    pub num_classes: usize,
    pub labels: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}
