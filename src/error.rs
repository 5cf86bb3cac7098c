//! Error taxonomy for the analyzer
//!
//! Validation failures are the caller's fault and map to 4xx responses.
//! Load failures are fatal at startup. Inference, fetch and timeout failures
//! map to 5xx responses and never expose internal detail to the caller.

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::api::dto::ErrorResponse;

/// Rejected request input. Nothing has been decoded or inferred yet.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error("missing `file` upload or `url` field")]
    MissingFile,

    #[error("uploaded file is empty")]
    EmptyUpload,

    #[error("missing `target_label` field")]
    MissingTargetLabel,

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("upload of {size} bytes exceeds the {limit} byte limit for {kind}")]
    PayloadTooLarge { kind: &'static str, size: usize, limit: usize },

    #[error("request body exceeds the {0} byte limit")]
    BodyTooLarge(usize),

    #[error("unknown model `{0}`")]
    UnknownModel(String),

    #[error("label `{0}` is not in the model's class set")]
    UnknownLabel(String),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    /// Machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Multipart(_) => "MULTIPART_ERROR",
            ValidationError::MissingFile => "MISSING_FILE",
            ValidationError::EmptyUpload => "EMPTY_UPLOAD",
            ValidationError::MissingTargetLabel => "MISSING_TARGET_LABEL",
            ValidationError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            ValidationError::PayloadTooLarge { .. } | ValidationError::BodyTooLarge(_) => {
                "PAYLOAD_TOO_LARGE"
            }
            ValidationError::UnknownModel(_) => "UNKNOWN_MODEL",
            ValidationError::UnknownLabel(_) => "UNKNOWN_LABEL",
            ValidationError::InvalidField { .. } => "INVALID_FIELD",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ValidationError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ValidationError::PayloadTooLarge { .. } | ValidationError::BodyTooLarge(_) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Model artifact could not be brought into memory
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("model artifact not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to read labels from {}: {source}", .path.display())]
    Labels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("labels file {} contains no labels", .0.display())]
    EmptyLabels(PathBuf),

    #[error("OpenVINO runtime error: {0}")]
    Runtime(String),

    #[error("invalid model configuration: {0}")]
    Config(String),
}

/// Top-level error returned by the analyzer service
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("inference failed: {0:#}")]
    Inference(#[source] anyhow::Error),

    #[error("fetching media failed: {0:#}")]
    Fetch(#[source] anyhow::Error),

    #[error("analysis exceeded {}s", .0.as_secs())]
    Timeout(Duration),
}

impl AnalyzerError {
    pub fn inference(err: anyhow::Error) -> Self {
        AnalyzerError::Inference(err)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AnalyzerError::Validation(e) => e.status(),
            AnalyzerError::Load(_) | AnalyzerError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AnalyzerError::Fetch(_) => StatusCode::BAD_GATEWAY,
            AnalyzerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AnalyzerError::Validation(e) => e.code(),
            AnalyzerError::Load(_) => "MODEL_UNAVAILABLE",
            AnalyzerError::Inference(_) => "INFERENCE_FAILED",
            AnalyzerError::Fetch(_) => "FETCH_FAILED",
            AnalyzerError::Timeout(_) => "ANALYSIS_TIMEOUT",
        }
    }

    /// Message safe to hand back to the caller
    pub fn public_message(&self) -> String {
        match self {
            AnalyzerError::Validation(e) => e.to_string(),
            AnalyzerError::Load(_) => "model is not available".to_string(),
            AnalyzerError::Inference(_) => "inference failed while processing the upload".to_string(),
            AnalyzerError::Fetch(_) => "could not fetch media from the given url".to_string(),
            AnalyzerError::Timeout(_) => self.to_string(),
        }
    }
}

impl IntoResponse for AnalyzerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }

        let body = ErrorResponse::new(&self.public_message(), self.code());
        (status, Json(body)).into_response()
    }
}
