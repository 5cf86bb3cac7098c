//! Axum REST API handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::{AnalyzerError, ValidationError};
use crate::service::{AnalysisRequest, AnalysisResult, AnalyzerService};

use super::docs;
use super::dto::*;

/// Header carrying the target count on annotated images
pub const TARGET_COUNT_HEADER: &str = "x-target-count";

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<AnalyzerService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<AnalyzerService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    let body_limit = state.service.config().body_limit();

    Router::new()
        .route("/", get(root_handler))
        // Analysis
        .route("/api/v1/analyze", post(analyze_handler))
        .route("/api/v1/analyze/image", post(analyze_image_handler))
        .route("/api/v1/analyze/video", post(analyze_video_handler))
        .route("/api/v1/annotate", post(annotate_handler))
        .route("/api/v1/models", get(models_handler))
        // System endpoints
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/docs", get(docs::docs_handler))
        .route("/openapi.json", get(docs::openapi_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Where the media for a request comes from
enum Media {
    Bytes { data: Vec<u8>, content_type: Option<String> },
    Url(String),
}

/// Media plus form fields pulled out of a multipart body
struct Upload {
    media: Media,
    request: AnalysisRequest,
}

fn multipart_error(err: MultipartError, body_limit: usize) -> ValidationError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ValidationError::BodyTooLarge(body_limit)
    } else {
        ValidationError::Multipart(err.body_text())
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, text: &str) -> Result<Option<T>, ValidationError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| ValidationError::InvalidField {
        field,
        reason: format!("`{}` is not a valid value", text),
    })
}

async fn read_upload(mut multipart: Multipart, body_limit: usize) -> Result<Upload, ValidationError> {
    let mut file = None;
    let mut url = None;
    let mut request = AnalysisRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, body_limit))?
    {
        let name = field.name().unwrap_or("").to_string();

        if name == "file" || name == "image" {
            let content_type = field.content_type().map(str::to_string);
            request.source_name = field.file_name().map(str::to_string);
            let bytes = field.bytes().await.map_err(|e| multipart_error(e, body_limit))?;
            file = Some((bytes.to_vec(), content_type));
            continue;
        }

        let text = field.text().await.map_err(|e| multipart_error(e, body_limit))?;
        match name.as_str() {
            "target_label" | "target" => request.target_label = Some(text),
            "min_confidence" | "confidence" => {
                request.min_confidence = parse_field("min_confidence", &text)?
            }
            "model" => request.model = Some(text).filter(|m| !m.trim().is_empty()),
            "max_frames" => request.max_frames = parse_field("max_frames", &text)?,
            "url" | "video_url" => url = Some(text).filter(|u| !u.trim().is_empty()),
            _ => debug!("Ignoring unknown form field '{}'", name),
        }
    }

    let media = match (file, url) {
        (Some(_), Some(_)) => {
            return Err(ValidationError::InvalidField {
                field: "url",
                reason: "send either a file or a url, not both".to_string(),
            })
        }
        (Some((data, content_type)), None) => Media::Bytes { data, content_type },
        (None, Some(url)) => Media::Url(url),
        (None, None) => return Err(ValidationError::MissingFile),
    };
    Ok(Upload { media, request })
}

/// Resolve the media bytes, downloading them when the form named a URL
async fn load_media(
    service: &AnalyzerService,
    upload: Upload,
) -> Result<(Vec<u8>, Option<String>, AnalysisRequest), AnalyzerError> {
    let Upload { media, mut request } = upload;
    match media {
        Media::Bytes { data, content_type } => Ok((data, content_type, request)),
        Media::Url(url) => {
            let remote = service.fetch(&url).await?;
            request.source_name = Some(remote.url.to_string());
            // Servers mislabel media freely; only trust a media type
            let content_type = remote
                .content_type
                .filter(|ct| ct.starts_with("image/") || ct.starts_with("video/"));
            Ok((remote.data, content_type, request))
        }
    }
}

/// API banner
#[utoipa::path(
    get,
    path = "/",
    tag = "system",
    responses((status = 200, description = "Service banner", body = MessageResponse))
)]
pub async fn root_handler() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Image Analyzer API. Interactive documentation is served at /docs".to_string(),
    })
}

/// Count a label in an image or video; the kind is detected from the upload
#[utoipa::path(
    post,
    path = "/api/v1/analyze",
    tag = "analysis",
    request_body(content = AnalyzeForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Per-frame detections and counts", body = AnalysisResult),
        (status = 400, description = "Invalid form", body = ErrorResponse),
        (status = 413, description = "Upload too large", body = ErrorResponse),
        (status = 415, description = "Not an image or video", body = ErrorResponse),
        (status = 500, description = "Inference failed", body = ErrorResponse),
        (status = 502, description = "Media URL could not be fetched", body = ErrorResponse),
        (status = 504, description = "Analysis timed out", body = ErrorResponse)
    )
)]
pub async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<AnalysisResult>, AnalyzerError> {
    let upload = read_upload(multipart, state.service.config().body_limit()).await?;
    let (data, content_type, request) = load_media(&state.service, upload).await?;
    let result = state
        .service
        .analyze(data, content_type.as_deref(), request)
        .await?;
    Ok(Json(result))
}

/// Count a label in an image
#[utoipa::path(
    post,
    path = "/api/v1/analyze/image",
    tag = "analysis",
    request_body(content = AnalyzeForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Detections and count", body = AnalysisResult),
        (status = 415, description = "Upload is not an image", body = ErrorResponse)
    )
)]
pub async fn analyze_image_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<AnalysisResult>, AnalyzerError> {
    let upload = read_upload(multipart, state.service.config().body_limit()).await?;
    let (data, content_type, request) = load_media(&state.service, upload).await?;
    let result = state
        .service
        .analyze_image(data, content_type.as_deref(), request)
        .await?;
    Ok(Json(result))
}

/// Count a label across the frames of a video
#[utoipa::path(
    post,
    path = "/api/v1/analyze/video",
    tag = "analysis",
    request_body(content = AnalyzeForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Per-frame detections and counts", body = AnalysisResult),
        (status = 415, description = "Upload is not a video", body = ErrorResponse),
        (status = 504, description = "Analysis timed out", body = ErrorResponse)
    )
)]
pub async fn analyze_video_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<AnalysisResult>, AnalyzerError> {
    let upload = read_upload(multipart, state.service.config().body_limit()).await?;
    let (data, content_type, request) = load_media(&state.service, upload).await?;
    let result = state
        .service
        .analyze_video(data, content_type.as_deref(), request)
        .await?;
    Ok(Json(result))
}

/// Draw detection boxes onto an image
#[utoipa::path(
    post,
    path = "/api/v1/annotate",
    tag = "analysis",
    request_body(content = AnalyzeForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "PNG with boxes drawn; target count in the `x-target-count` header"),
        (status = 415, description = "Upload is not an image", body = ErrorResponse)
    )
)]
pub async fn annotate_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, AnalyzerError> {
    let upload = read_upload(multipart, state.service.config().body_limit()).await?;
    let (data, content_type, request) = load_media(&state.service, upload).await?;
    let (png, result) = state
        .service
        .annotate(data, content_type.as_deref(), request)
        .await?;

    let headers = [
        (header::CONTENT_TYPE, "image/png".to_string()),
        (
            HeaderName::from_static(TARGET_COUNT_HEADER),
            result.aggregate_count.to_string(),
        ),
    ];
    Ok((headers, png).into_response())
}

/// Loaded models and their class labels
#[utoipa::path(
    get,
    path = "/api/v1/models",
    tag = "system",
    responses((status = 200, description = "Loaded models", body = ModelsResponse))
)]
pub async fn models_handler(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state
        .service
        .models()
        .into_iter()
        .map(|m| ModelDto {
            name: m.name,
            family: m.family,
            is_default: m.is_default,
            num_classes: m.num_classes,
            labels: m.labels,
        })
        .collect();

    Json(ModelsResponse {
        default_model: state.service.registry().default_name().to_string(),
        models,
    })
}

/// Health check handler
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health();
    Json(HealthResponse {
        status: health.status,
        version: health.version,
        models: health.models,
        video_supported: health.video_supported,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::fixture::{png_with, FixtureDetector, RED};
    use crate::engine::{ModelRegistry, ObjectDetector};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const BOUNDARY: &str = "analyzer-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a [u8]),
    }

    fn multipart_body(parts: &[Part]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, content_type, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"upload.bin\"\r\nContent-Type: {}\r\n\r\n",
                            name, content_type
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn post(uri: &str, parts: &[Part]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn router_with(detector: Arc<FixtureDetector>, config: Config) -> Router {
        let registry = ModelRegistry::new(vec![detector as Arc<dyn ObjectDetector>]).unwrap();
        let service = AnalyzerService::new(Arc::new(registry), &config);
        create_rest_router(Arc::new(AppState::new(Arc::new(service))))
    }

    fn router(detector: Arc<FixtureDetector>) -> Router {
        router_with(detector, Config::default())
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let app = router(Arc::new(FixtureDetector::new()));

        let response = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["message"].is_string());

        for uri in ["/health", "/api/v1/health"] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = json_body(response).await;
            assert_eq!(body["status"], "ok");
            assert_eq!(body["models"][0], "fixture");
        }
    }

    #[tokio::test]
    async fn test_models_listing() {
        let app = router(Arc::new(FixtureDetector::named("yolov8n")));
        let response = app.oneshot(get("/api/v1/models")).await.unwrap();
        let body = json_body(response).await;

        assert_eq!(body["default_model"], "yolov8n");
        assert_eq!(body["models"][0]["family"], "yolov8");
        assert_eq!(body["models"][0]["labels"][0], "person");
    }

    #[tokio::test]
    async fn test_analyze_counts_target() {
        let app = router(Arc::new(FixtureDetector::new()));
        let png = png_with(64, 64, &[(RED, 20, 20, 10)]);

        let response = app
            .oneshot(post(
                "/api/v1/analyze",
                &[
                    Part::File("file", "image/png", &png),
                    Part::Text("target_label", "person"),
                    Part::Text("min_confidence", "0.5"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["aggregate_count"], 1);
        assert_eq!(body["total_frames"], 1);
        assert_eq!(body["media_kind"], "image");
        assert_eq!(body["source"], "upload.bin");
        assert_eq!(body["frames"][0]["detections"][0]["label"], "person");
    }

    #[tokio::test]
    async fn test_field_aliases() {
        let app = router(Arc::new(FixtureDetector::new()));
        let png = png_with(32, 32, &[(RED, 4, 4, 6)]);

        let response = app
            .oneshot(post(
                "/api/v1/analyze/image",
                &[
                    Part::File("image", "image/png", &png),
                    Part::Text("target", "Person"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["aggregate_count"], 1);
    }

    #[tokio::test]
    async fn test_unsupported_upload_is_415_without_inference() {
        let detector = Arc::new(FixtureDetector::new());
        let app = router(detector.clone());

        let response = app
            .oneshot(post(
                "/api/v1/analyze",
                &[
                    Part::File("file", "text/plain", b"name,count\nperson,3\n"),
                    Part::Text("target_label", "person"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(json_body(response).await["code"], "UNSUPPORTED_MEDIA_TYPE");
        assert_eq!(detector.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let app = router(Arc::new(FixtureDetector::new()));
        let png = png_with(8, 8, &[]);

        let response = app
            .clone()
            .oneshot(post("/api/v1/analyze", &[Part::Text("target_label", "person")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "MISSING_FILE");

        let response = app
            .oneshot(post("/api/v1/analyze", &[Part::File("file", "image/png", &png)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "MISSING_TARGET_LABEL");
    }

    #[tokio::test]
    async fn test_analyze_by_url() {
        let base = crate::media::remote::tests::serve_png().await;
        let detector = Arc::new(FixtureDetector::new());
        let registry = ModelRegistry::new(vec![detector.clone() as Arc<dyn ObjectDetector>]).unwrap();
        let service = AnalyzerService::new(Arc::new(registry), &Config::default())
            .with_fetcher(crate::media::remote::tests::local_fetcher(1 << 20));
        let app = create_rest_router(Arc::new(AppState::new(Arc::new(service))));

        let url = format!("{}/cat.png", base);
        let response = app
            .oneshot(post(
                "/api/v1/analyze",
                &[Part::Text("url", &url), Part::Text("target_label", "person")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["aggregate_count"], 1);
        assert_eq!(body["media_kind"], "image");
        assert_eq!(body["source"], url.as_str());
        assert_eq!(detector.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_url_is_rejected() {
        let detector = Arc::new(FixtureDetector::new());
        let app = router(detector.clone());

        let response = app
            .clone()
            .oneshot(post(
                "/api/v1/analyze",
                &[
                    Part::Text("video_url", "youtube dot com slash watch"),
                    Part::Text("target_label", "person"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_FIELD");

        let png = png_with(8, 8, &[]);
        let response = app
            .oneshot(post(
                "/api/v1/analyze",
                &[
                    Part::File("file", "image/png", &png),
                    Part::Text("url", "https://example.com/a.png"),
                    Part::Text("target_label", "person"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_FIELD");
        assert_eq!(detector.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_numeric_field() {
        let app = router(Arc::new(FixtureDetector::new()));
        let png = png_with(8, 8, &[]);

        let response = app
            .oneshot(post(
                "/api/v1/analyze",
                &[
                    Part::File("file", "image/png", &png),
                    Part::Text("target_label", "person"),
                    Part::Text("max_frames", "lots"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_FIELD");
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let mut config = Config::default();
        config.analysis.max_image_bytes = 1024;
        config.analysis.max_video_bytes = 1024;
        let app = router_with(Arc::new(FixtureDetector::new()), config);

        let blob = vec![7u8; 256 * 1024];
        let response = app
            .oneshot(post(
                "/api/v1/analyze",
                &[
                    Part::Text("target_label", "person"),
                    Part::File("file", "image/png", &blob),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_backend_failure_is_500_with_generic_message() {
        let app = router(Arc::new(FixtureDetector::new().failing()));
        let png = png_with(8, 8, &[]);

        let response = app
            .oneshot(post(
                "/api/v1/analyze",
                &[
                    Part::File("file", "image/png", &png),
                    Part::Text("target_label", "person"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["code"], "INFERENCE_FAILED");
        assert!(!body["error"].as_str().unwrap().contains("fixture backend"));
    }

    #[tokio::test]
    async fn test_annotate_returns_png() {
        let app = router(Arc::new(FixtureDetector::new()));
        let png = png_with(48, 32, &[(RED, 8, 8, 8)]);

        let response = app
            .oneshot(post(
                "/api/v1/annotate",
                &[
                    Part::File("file", "image/png", &png),
                    Part::Text("target_label", "person"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[TARGET_COUNT_HEADER], "1");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (48, 32));
    }

    #[tokio::test]
    async fn test_docs_are_served() {
        let app = router(Arc::new(FixtureDetector::new()));

        let response = app.clone().oneshot(get("/docs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("swagger-ui"));
        assert!(page.contains("dom_id: \"#swagger-ui\""));

        let response = app.oneshot(get("/openapi.json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["paths"]["/api/v1/analyze"]["post"].is_object());
    }
}
