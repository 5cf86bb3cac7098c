//! Analyzer Service - Core business logic
//!
//! Orchestrates upload validation, decoding, detection and counting. All
//! decoding and inference run on the blocking pool under a request timeout.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AnalysisConfig, Config, MAX_FRAMES_CEILING};
use crate::engine::preprocess::decode_image;
use crate::engine::{ModelRegistry, ObjectDetector};
use crate::error::{AnalyzerError, ValidationError};
use crate::media::{classify, parse_media_url, MediaFetcher, MediaKind, RemoteMedia, VideoDecoder, VideoInfo};
use crate::utils::image::{draw_detections, encode_png};

use super::counting::{resolve_confidence, FrameAccumulator};
use super::types::*;

/// Everything resolved from a request before any work starts
struct Plan {
    detector: Arc<dyn ObjectDetector>,
    source: String,
    target_label: String,
    target_label_known: bool,
    min_confidence: f32,
    max_frames: usize,
}

/// Image/video analysis service
pub struct AnalyzerService {
    registry: Arc<ModelRegistry>,
    decoder: VideoDecoder,
    fetcher: MediaFetcher,
    config: AnalysisConfig,
    timeout: Duration,
    video_supported: bool,
}

impl AnalyzerService {
    pub fn new(registry: Arc<ModelRegistry>, config: &Config) -> Self {
        let decoder = VideoDecoder::from_config(&config.analysis);
        let video_supported = decoder.is_available();
        if !video_supported {
            warn!(
                "{} / {} not runnable, video analysis will fail",
                config.analysis.ffmpeg_path.display(),
                config.analysis.ffprobe_path.display()
            );
        }

        let fetcher = MediaFetcher::new(
            config.analysis.media_limit(),
            Duration::from_secs(config.analysis.fetch_timeout_secs),
        );

        Self {
            registry,
            decoder,
            fetcher,
            timeout: Duration::from_secs(config.analysis.request_timeout_secs),
            config: config.analysis.clone(),
            video_supported,
        }
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the HTTP client used for `url` requests
    pub fn with_fetcher(mut self, fetcher: MediaFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Analyze an upload whose kind is sniffed from its bytes
    pub async fn analyze(
        &self,
        data: Vec<u8>,
        content_type: Option<&str>,
        request: AnalysisRequest,
    ) -> Result<AnalysisResult, AnalyzerError> {
        self.run(data, content_type, None, request).await
    }

    /// Analyze an upload that must be an image
    pub async fn analyze_image(
        &self,
        data: Vec<u8>,
        content_type: Option<&str>,
        request: AnalysisRequest,
    ) -> Result<AnalysisResult, AnalyzerError> {
        self.run(data, content_type, Some(MediaKind::Image), request).await
    }

    /// Analyze an upload that must be a video
    pub async fn analyze_video(
        &self,
        data: Vec<u8>,
        content_type: Option<&str>,
        request: AnalysisRequest,
    ) -> Result<AnalysisResult, AnalyzerError> {
        self.run(data, content_type, Some(MediaKind::Video), request).await
    }

    /// Detect on an image and return it as PNG with the boxes drawn in
    pub async fn annotate(
        &self,
        data: Vec<u8>,
        content_type: Option<&str>,
        request: AnalysisRequest,
    ) -> Result<(Vec<u8>, AnalysisResult), AnalyzerError> {
        let start = Instant::now();
        self.validate_upload(&data, content_type, Some(MediaKind::Image))?;
        let plan = self.prepare(&request)?;

        let detector = plan.detector.clone();
        let target_label = plan.target_label.clone();
        let min_confidence = plan.min_confidence;
        let (png, accumulator) = self
            .run_blocking(Arc::new(AtomicBool::new(false)), move || {
                let image = decode_image(&data).map_err(AnalyzerError::inference)?;
                let detections = detector
                    .detect(&image, min_confidence)
                    .map_err(AnalyzerError::inference)?;

                let mut accumulator = FrameAccumulator::new(&target_label, min_confidence);
                let frame = accumulator.push(detections);
                let canvas = draw_detections(&image, &frame.detections, &target_label);
                let png = encode_png(&canvas).map_err(AnalyzerError::inference)?;
                Ok((png, accumulator))
            })
            .await?;

        let result = Self::finish(plan, MediaKind::Image, accumulator, None, start);
        Ok((png, result))
    }

    /// Validate and download a media URL, capped at the largest upload size.
    /// The bytes then go through the same checks as an upload.
    pub async fn fetch(&self, raw_url: &str) -> Result<RemoteMedia, AnalyzerError> {
        let url = parse_media_url(raw_url)?;
        self.fetcher.fetch(&url).await
    }

    pub fn health(&self) -> HealthResult {
        HealthResult {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            models: self.registry.iter().map(|d| d.name().to_string()).collect(),
            video_supported: self.video_supported,
        }
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        let default = self.registry.default_name();
        self.registry
            .iter()
            .map(|d| ModelInfo {
                name: d.name().to_string(),
                family: d.family(),
                is_default: d.name() == default,
                num_classes: d.labels().len(),
                labels: d.labels().names().to_vec(),
            })
            .collect()
    }

    async fn run(
        &self,
        data: Vec<u8>,
        content_type: Option<&str>,
        expected: Option<MediaKind>,
        request: AnalysisRequest,
    ) -> Result<AnalysisResult, AnalyzerError> {
        let start = Instant::now();
        let kind = self.validate_upload(&data, content_type, expected)?;
        let plan = self.prepare(&request)?;

        info!(
            "Analyzing {} {} ({} bytes) for '{}' with {} at {:.2}",
            kind,
            plan.source,
            data.len(),
            plan.target_label,
            plan.detector.name(),
            plan.min_confidence
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let detector = plan.detector.clone();
        let target_label = plan.target_label.clone();
        let min_confidence = plan.min_confidence;

        let (accumulator, video) = match kind {
            MediaKind::Image => {
                self.run_blocking(cancel, move || {
                    let image = decode_image(&data).map_err(AnalyzerError::inference)?;
                    let detections = detector
                        .detect(&image, min_confidence)
                        .map_err(AnalyzerError::inference)?;

                    let mut accumulator = FrameAccumulator::new(&target_label, min_confidence);
                    accumulator.push(detections);
                    Ok((accumulator, None))
                })
                .await?
            }
            MediaKind::Video => {
                let decoder = self.decoder.clone();
                let max_frames = plan.max_frames;
                let flag = cancel.clone();
                self.run_blocking(cancel, move || {
                    analyze_frames(
                        &decoder,
                        &data,
                        detector.as_ref(),
                        &target_label,
                        min_confidence,
                        max_frames,
                        &flag,
                    )
                    .map(|(accumulator, info)| (accumulator, Some(info)))
                    .map_err(AnalyzerError::inference)
                })
                .await?
            }
        };

        let result = Self::finish(plan, kind, accumulator, video, start);
        info!(
            "Counted {} x '{}' over {} frames in {}ms",
            result.aggregate_count, result.target_label, result.total_frames, result.inference_time_ms
        );
        Ok(result)
    }

    /// Classify the upload and enforce the per-kind size limit
    fn validate_upload(
        &self,
        data: &[u8],
        content_type: Option<&str>,
        expected: Option<MediaKind>,
    ) -> Result<MediaKind, ValidationError> {
        let kind = classify(content_type, data)?;

        if let Some(expected) = expected {
            if expected != kind {
                return Err(ValidationError::UnsupportedMediaType(format!(
                    "expected {} upload, got {}",
                    expected, kind
                )));
            }
        }

        let limit = match kind {
            MediaKind::Image => self.config.max_image_bytes,
            MediaKind::Video => self.config.max_video_bytes,
        };
        if data.len() > limit {
            return Err(ValidationError::PayloadTooLarge {
                kind: kind.as_str(),
                size: data.len(),
                limit,
            });
        }

        Ok(kind)
    }

    fn prepare(&self, request: &AnalysisRequest) -> Result<Plan, ValidationError> {
        let target_label = request
            .target_label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.default_target_label.clone())
            .ok_or(ValidationError::MissingTargetLabel)?;

        let detector = self
            .registry
            .get(request.model.as_deref())
            .ok_or_else(|| ValidationError::UnknownModel(request.model.clone().unwrap_or_default()))?;

        let target_label_known = detector.labels().contains(&target_label);
        if !target_label_known {
            if self.config.reject_unknown_labels {
                return Err(ValidationError::UnknownLabel(target_label));
            }
            warn!("Label '{}' unknown to model {}, count will be 0", target_label, detector.name());
        }

        let ceiling = self.config.max_frames.min(MAX_FRAMES_CEILING);
        let max_frames = match request.max_frames {
            None => ceiling,
            Some(0) => {
                return Err(ValidationError::InvalidField {
                    field: "max_frames",
                    reason: "must be at least 1".to_string(),
                })
            }
            Some(n) => n.min(ceiling),
        };

        let source = request
            .source_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Plan {
            detector,
            source,
            target_label,
            target_label_known,
            min_confidence: resolve_confidence(request.min_confidence, self.config.default_confidence),
            max_frames,
        })
    }

    /// Run `work` on the blocking pool. On timeout the cancel flag is raised
    /// so a frame loop stops at its next frame.
    async fn run_blocking<T, F>(&self, cancel: Arc<AtomicBool>, work: F) -> Result<T, AnalyzerError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, AnalyzerError> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(work);
        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(AnalyzerError::inference(anyhow!("analysis worker failed: {}", e))),
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                Err(AnalyzerError::Timeout(self.timeout))
            }
        }
    }

    fn finish(
        plan: Plan,
        kind: MediaKind,
        accumulator: FrameAccumulator,
        video: Option<VideoInfo>,
        start: Instant,
    ) -> AnalysisResult {
        let (frames, aggregate_count, class_summary) = accumulator.into_parts();
        AnalysisResult {
            source: plan.source,
            media_kind: kind,
            target_label: plan.target_label,
            min_confidence: plan.min_confidence,
            model: plan.detector.name().to_string(),
            model_family: plan.detector.family(),
            total_frames: frames.len(),
            frames,
            aggregate_count,
            class_summary,
            target_label_known: plan.target_label_known,
            video,
            inference_time_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Spool the upload to disk and run detection on each decoded frame.
///
/// Dropping the frame stream on any exit path kills ffmpeg, and the
/// temporary file is removed when it goes out of scope.
fn analyze_frames(
    decoder: &VideoDecoder,
    data: &[u8],
    detector: &dyn ObjectDetector,
    target_label: &str,
    min_confidence: f32,
    max_frames: usize,
    cancel: &AtomicBool,
) -> anyhow::Result<(FrameAccumulator, VideoInfo)> {
    let mut file = tempfile::Builder::new()
        .prefix("analyzer-upload-")
        .tempfile()
        .context("failed to create temporary upload file")?;
    file.write_all(data).context("failed to spool upload")?;
    file.flush()?;

    let stream = decoder.frames(file.path(), max_frames)?;
    let info = stream.info().clone();
    let mut accumulator = FrameAccumulator::new(target_label, min_confidence);

    for frame in stream.take(max_frames) {
        if cancel.load(Ordering::SeqCst) {
            bail!("analysis cancelled after {} frames", accumulator.len());
        }
        let frame = frame?;
        let detections = detector
            .detect(&frame, min_confidence)
            .with_context(|| format!("detection failed on frame {}", accumulator.len()))?;
        let result = accumulator.push(detections);
        debug!("Frame {}: {} x '{}'", result.frame_index, result.target_count, target_label);
    }

    if accumulator.is_empty() {
        bail!("video contained no decodable frames");
    }
    Ok((accumulator, info))
}
