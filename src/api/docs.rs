//! OpenAPI document and the interactive docs page

use axum::response::{Html, Json};
use utoipa::OpenApi;

use crate::engine::{BoundingBox, Detection, ModelFamily};
use crate::media::{MediaKind, VideoInfo};
use crate::service::{AnalysisResult, FrameResult};

use super::dto::*;
use super::rest;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Image Analyzer API",
        description = "Count objects of a given label in images and videos with a YOLO detector"
    ),
    paths(
        rest::root_handler,
        rest::analyze_handler,
        rest::analyze_image_handler,
        rest::analyze_video_handler,
        rest::annotate_handler,
        rest::models_handler,
        rest::health_handler
    ),
    components(schemas(
        AnalyzeForm,
        AnalysisResult,
        FrameResult,
        Detection,
        BoundingBox,
        MediaKind,
        VideoInfo,
        ModelFamily,
        MessageResponse,
        HealthResponse,
        ModelsResponse,
        ModelDto,
        ErrorResponse
    )),
    tags(
        (name = "analysis", description = "Object detection and counting"),
        (name = "system", description = "Service status")
    )
)]
pub struct ApiDoc;

const DOCS_PAGE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>Image Analyzer API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js" crossorigin></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: "/openapi.json", dom_id: "#swagger-ui" });
    };
  </script>
</body>
</html>
"##;

pub async fn docs_handler() -> Html<&'static str> {
    Html(DOCS_PAGE)
}

pub async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
