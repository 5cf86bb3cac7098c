//! Analyzer service configuration
//!
//! Loaded from a TOML file, then patched from the environment so container
//! deployments can override ports and model paths without editing the file.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::engine::loader::ModelFamily;

/// Hard ceiling on frames analyzed per video request
pub const MAX_FRAMES_CEILING: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: String,
    /// Floor below which raw candidates are dropped before NMS
    pub candidate_confidence: f32,
    pub nms_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub family: ModelFamily,
    pub path: PathBuf,
    #[serde(default)]
    pub labels: Option<PathBuf>,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub default_confidence: f32,
    /// Used when a request omits `target_label`
    pub default_target_label: Option<String>,
    pub max_frames: usize,
    pub max_image_bytes: usize,
    pub max_video_bytes: usize,
    pub request_timeout_secs: u64,
    /// Connect plus transfer time allowed when fetching a `url` field
    pub fetch_timeout_secs: u64,
    pub reject_unknown_labels: bool,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Decoded frames buffered between ffmpeg and the inference loop
    pub frame_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Read a TOML config; a missing file is `None` rather than an error
    pub fn load_optional(path: &str) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(toml::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn default_path() -> String {
        std::env::var("ANALYZER_CONFIG").unwrap_or_else(|_| "config.toml".to_string())
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("APP_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = lookup("APP_HOST") {
            self.server.host = host;
        }
        if let Some(device) = lookup("INFERENCE_DEVICE") {
            self.inference.device = device;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(path) = lookup("FFMPEG_PATH") {
            self.analysis.ffmpeg_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("FFPROBE_PATH") {
            self.analysis.ffprobe_path = PathBuf::from(path);
        }

        // Model overrides apply to the default (first) model
        if let Some(model) = self.models.first_mut() {
            if let Some(path) = lookup("MODEL_PATH") {
                model.path = PathBuf::from(path);
            }
            if let Some(family) = lookup("MODEL_FAMILY").and_then(|v| v.parse().ok()) {
                model.family = family;
            }
            if let Some(labels) = lookup("LABELS_PATH") {
                model.labels = Some(PathBuf::from(labels));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            bail!("at least one [[models]] entry is required");
        }
        for model in &self.models {
            if model.name.trim().is_empty() {
                bail!("model name must not be empty");
            }
            if model.input_width == 0 || model.input_height == 0 {
                bail!("model `{}` has a zero input size", model.name);
            }
        }
        let mut names: Vec<&str> = self.models.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.models.len() {
            bail!("model names must be unique");
        }

        let conf = self.analysis.default_confidence;
        if !(conf > 0.0 && conf <= 1.0) {
            bail!("analysis.default_confidence must be in (0, 1], got {}", conf);
        }
        let floor = self.inference.candidate_confidence;
        if !(0.0..=1.0).contains(&floor) {
            bail!("inference.candidate_confidence must be in [0, 1], got {}", floor);
        }
        if !(self.inference.nms_threshold > 0.0 && self.inference.nms_threshold <= 1.0) {
            bail!("inference.nms_threshold must be in (0, 1]");
        }
        if self.analysis.max_frames == 0 || self.analysis.max_frames > MAX_FRAMES_CEILING {
            bail!("analysis.max_frames must be in 1..={}", MAX_FRAMES_CEILING);
        }
        if self.analysis.max_image_bytes == 0 || self.analysis.max_video_bytes == 0 {
            bail!("upload size limits must be non-zero");
        }
        if self.analysis.request_timeout_secs == 0 || self.analysis.fetch_timeout_secs == 0 {
            bail!("analysis timeouts must be non-zero");
        }
        if self.analysis.frame_queue == 0 {
            bail!("analysis.frame_queue must be non-zero");
        }
        Ok(())
    }
}

impl AnalysisConfig {
    /// Largest media accepted by any route
    pub fn media_limit(&self) -> usize {
        self.max_image_bytes.max(self.max_video_bytes)
    }

    /// Largest request body the router should accept
    pub fn body_limit(&self) -> usize {
        // multipart framing and text fields ride on top of the file
        self.media_limit() + 64 * 1024
    }
}

fn default_input_size() -> u32 {
    640
}

fn default_models() -> Vec<ModelConfig> {
    vec![ModelConfig {
        name: "yolov8n".to_string(),
        family: ModelFamily::Yolov8,
        path: PathBuf::from("models/yolov8n.onnx"),
        labels: None,
        input_width: default_input_size(),
        input_height: default_input_size(),
    }]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            candidate_confidence: 0.25,
            nms_threshold: 0.45,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_confidence: 0.45,
            default_target_label: None,
            max_frames: 100,
            max_image_bytes: 20 * 1024 * 1024,
            max_video_bytes: 200 * 1024 * 1024,
            request_timeout_secs: 120,
            fetch_timeout_secs: 30,
            reject_unknown_labels: false,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            frame_queue: 8,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            inference: InferenceConfig::default(),
            models: default_models(),
            analysis: AnalysisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
