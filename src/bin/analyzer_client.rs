//! analyzer-client - upload images and videos to a running analyzer service

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::blocking::{multipart, Client, Response};

use image_analyzer::api::dto::{ErrorResponse, HealthResponse, ModelsResponse};
use image_analyzer::api::rest::TARGET_COUNT_HEADER;
use image_analyzer::service::AnalysisResult;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Base URL of the analyzer service.
    #[arg(long, env = "ANALYZER_URL", default_value = "http://localhost:8090")]
    url: String,
    /// Seconds to wait for a response.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show service status.
    Health,
    /// List loaded models.
    Models {
        /// Print every class label of each model.
        #[arg(long)]
        labels: bool,
    },
    /// Count a label in an image or video.
    Analyze {
        #[command(flatten)]
        source: Source,
        #[command(flatten)]
        options: AnalyzeOptions,
        /// Force the upload kind instead of letting the service detect it.
        #[arg(long, value_enum, default_value = "auto")]
        kind: Kind,
        /// Print the raw JSON result.
        #[arg(long)]
        json: bool,
    },
    /// Save an image with detection boxes drawn in.
    Annotate {
        #[command(flatten)]
        source: Source,
        #[command(flatten)]
        options: AnalyzeOptions,
        /// Where to write the PNG.
        #[arg(long, short)]
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct Source {
    /// Local image or video to upload.
    #[arg(required_unless_present = "url", conflicts_with = "url")]
    file: Option<PathBuf>,
    /// Have the service fetch the media from this http(s) URL instead.
    #[arg(long)]
    url: Option<String>,
}

#[derive(clap::Args, Debug)]
struct AnalyzeOptions {
    /// Label to count, e.g. `person`.
    #[arg(long)]
    target: String,
    /// Minimum confidence in (0, 1].
    #[arg(long)]
    confidence: Option<f32>,
    /// Model name; defaults to the service's first model.
    #[arg(long)]
    model: Option<String>,
    /// Frame cap for videos.
    #[arg(long)]
    max_frames: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Auto,
    Image,
    Video,
}

impl Kind {
    fn endpoint(self) -> &'static str {
        match self {
            Kind::Auto => "/api/v1/analyze",
            Kind::Image => "/api/v1/analyze/image",
            Kind::Video => "/api/v1/analyze/video",
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()?;
    let base = args.url.trim_end_matches('/');

    match args.command {
        Command::Health => {
            let health: HealthResponse = parse_json(client.get(format!("{}/health", base)).send()?)?;
            println!("status:   {}", health.status);
            println!("version:  {}", health.version);
            println!("models:   {}", health.models.join(", "));
            println!("video:    {}", if health.video_supported { "yes" } else { "no" });
            println!("uptime:   {}s", health.uptime_seconds);
        }
        Command::Models { labels } => {
            let models: ModelsResponse = parse_json(client.get(format!("{}/api/v1/models", base)).send()?)?;
            for model in models.models {
                let marker = if model.is_default { "*" } else { " " };
                println!("{} {} ({}, {} classes)", marker, model.name, model.family, model.num_classes);
                if labels {
                    println!("    {}", model.labels.join(", "));
                }
            }
        }
        Command::Analyze {
            source,
            options,
            kind,
            json,
        } => {
            let form = build_form(&source, &options)?;
            let response = client
                .post(format!("{}{}", base, kind.endpoint()))
                .multipart(form)
                .send()?;
            let result: AnalysisResult = parse_json(response)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", render_result(&result));
            }
        }
        Command::Annotate {
            source,
            options,
            output,
        } => {
            let form = build_form(&source, &options)?;
            let response = client
                .post(format!("{}/api/v1/annotate", base))
                .multipart(form)
                .send()?;
            let response = check_status(response)?;
            let count = response
                .headers()
                .get(TARGET_COUNT_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("?")
                .to_string();
            let png = response.bytes()?;
            std::fs::write(&output, &png)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("{} x '{}' -> {}", count, options.target, output.display());
        }
    }

    Ok(())
}

fn build_form(source: &Source, options: &AnalyzeOptions) -> Result<multipart::Form> {
    let form = match (&source.file, &source.url) {
        (Some(file), _) => multipart::Form::new()
            .file("file", file)
            .with_context(|| format!("failed to read {}", file.display()))?,
        (None, Some(url)) => multipart::Form::new().text("url", url.clone()),
        (None, None) => bail!("either a file or --url is required"),
    };
    let mut form = form.text("target_label", options.target.clone());

    if let Some(confidence) = options.confidence {
        form = form.text("min_confidence", confidence.to_string());
    }
    if let Some(model) = &options.model {
        form = form.text("model", model.clone());
    }
    if let Some(max_frames) = options.max_frames {
        form = form.text("max_frames", max_frames.to_string());
    }
    Ok(form)
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    bail!("{}", describe_error(status.as_u16(), &body))
}

fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response)?;
    response
        .json()
        .map_err(|e| anyhow!("unexpected response from service: {}", e))
}

fn describe_error(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => format!("service returned {} {}: {}", status, err.code, err.error),
        Err(_) => format!("service returned {}: {}", status, body.trim()),
    }
}

fn render_result(result: &AnalysisResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "source:      {} ({})", result.source, result.media_kind);
    let _ = writeln!(out, "model:       {} ({})", result.model, result.model_family);
    let _ = writeln!(out, "target:      {} @ {:.2}", result.target_label, result.min_confidence);
    if let Some(video) = &result.video {
        let fps = video.fps.map_or("?".to_string(), |f| format!("{:.2}", f));
        let frames = video.frame_count.map_or("?".to_string(), |n| n.to_string());
        let _ = writeln!(
            out,
            "video:       {}x{} {} @ {} fps, {} frame(s) in stream",
            video.width, video.height, video.codec, fps, frames
        );
    }
    if !result.target_label_known {
        let _ = writeln!(out, "warning:     model has no class named '{}'", result.target_label);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "{:>6}  {:>6}  {}", "frame", "count", "detections");
    for frame in &result.frames {
        let labels: Vec<String> = frame
            .detections
            .iter()
            .map(|d| format!("{} {:.2}", d.label, d.confidence))
            .collect();
        let _ = writeln!(out, "{:>6}  {:>6}  {}", frame.frame_index, frame.target_count, labels.join(", "));
    }

    let _ = writeln!(out);
    let summary: Vec<String> = result
        .class_summary
        .iter()
        .map(|(label, n)| format!("{}={}", label, n))
        .collect();
    let _ = writeln!(out, "classes:     {}", summary.join(" "));
    let _ = writeln!(
        out,
        "total:       {} x '{}' over {} frame(s) in {}ms",
        result.aggregate_count, result.target_label, result.total_frames, result.inference_time_ms
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AnalysisResult {
        serde_json::from_str(
            r#"{
                "source": "street.mp4",
                "media_kind": "video",
                "target_label": "person",
                "min_confidence": 0.45,
                "model": "yolov8n",
                "model_family": "yolov8",
                "total_frames": 2,
                "frames": [
                    {"frame_index": 0, "target_count": 1, "detections": [
                        {"label": "person", "class_id": 0, "confidence": 0.91,
                         "bbox": {"x": 1.0, "y": 2.0, "width": 30.0, "height": 60.0}}
                    ]},
                    {"frame_index": 1, "target_count": 0, "detections": []}
                ],
                "aggregate_count": 1,
                "class_summary": {"person": 1},
                "target_label_known": true,
                "video": {"width": 1280, "height": 720, "frame_count": 300,
                          "fps": 29.97, "codec": "h264"},
                "inference_time_ms": 42
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_render_result() {
        let text = render_result(&sample());
        assert!(text.contains("person 0.91"));
        assert!(text.contains("total:       1 x 'person' over 2 frame(s) in 42ms"));
        assert!(text.contains("classes:     person=1"));
        assert!(text.contains("video:       1280x720 h264 @ 29.97 fps, 300 frame(s) in stream"));
        assert!(!text.contains("warning"));
    }

    #[test]
    fn test_describe_error() {
        let body = r#"{"error": "uploaded file is empty", "code": "EMPTY_UPLOAD"}"#;
        assert_eq!(
            describe_error(400, body),
            "service returned 400 EMPTY_UPLOAD: uploaded file is empty"
        );
        assert_eq!(describe_error(502, "bad gateway\n"), "service returned 502: bad gateway");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "analyzer-client",
            "analyze",
            "clip.mp4",
            "--target",
            "car",
            "--max-frames",
            "10",
            "--kind",
            "video",
        ])
        .unwrap();

        match args.command {
            Command::Analyze { options, kind, .. } => {
                assert_eq!(options.target, "car");
                assert_eq!(options.max_frames, Some(10));
                assert_eq!(kind, Kind::Video);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_url_replaces_file() {
        let args = Args::try_parse_from([
            "analyzer-client",
            "analyze",
            "--url",
            "https://example.com/street.mp4",
            "--target",
            "car",
        ])
        .unwrap();
        match args.command {
            Command::Analyze { source, .. } => {
                assert!(source.file.is_none());
                assert_eq!(source.url.as_deref(), Some("https://example.com/street.mp4"));
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Args::try_parse_from(["analyzer-client", "analyze", "--target", "car"]).is_err());
        assert!(Args::try_parse_from([
            "analyzer-client",
            "analyze",
            "clip.mp4",
            "--url",
            "https://example.com/a.mp4",
            "--target",
            "car",
        ])
        .is_err());
    }
}
