//! Media fetched by URL instead of uploaded
//!
//! The body is streamed with a hard byte cap so a large remote file is
//! abandoned as soon as it crosses the limit, before it is fully buffered.

use std::time::Duration;

use anyhow::anyhow;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use tracing::{debug, info, warn};

use crate::error::{AnalyzerError, ValidationError};

/// Bytes and metadata of a fetched resource
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub url: Url,
}

/// Accept only absolute http(s) URLs with a host
pub fn parse_media_url(raw: &str) -> Result<Url, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField { field: "url", reason };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(format!("`{}` is not a valid URL: {}", raw.trim(), e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("URL has no host".to_string()));
    }
    Ok(url)
}

/// HTTP client for media URLs
#[derive(Clone)]
pub struct MediaFetcher {
    client: Option<Client>,
    limit: usize,
}

impl MediaFetcher {
    pub fn new(limit: usize, timeout: Duration) -> Self {
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("HTTP client unavailable, URL analysis disabled: {}", e);
                None
            }
        };
        Self { client, limit }
    }

    pub fn with_client(client: Client, limit: usize) -> Self {
        Self {
            client: Some(client),
            limit,
        }
    }

    pub async fn fetch(&self, url: &Url) -> Result<RemoteMedia, AnalyzerError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AnalyzerError::Fetch(anyhow!("no HTTP client")))?;

        info!("Fetching media from {}", url);
        let mut response = client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AnalyzerError::Fetch(anyhow!(e).context(format!("GET {}", url))))?;

        if let Some(length) = response.content_length() {
            if length as usize > self.limit {
                return Err(ValidationError::PayloadTooLarge {
                    kind: "remote media",
                    size: length as usize,
                    limit: self.limit,
                }
                .into());
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AnalyzerError::Fetch(anyhow!(e).context(format!("reading {}", url))))?
        {
            if data.len() + chunk.len() > self.limit {
                return Err(ValidationError::PayloadTooLarge {
                    kind: "remote media",
                    size: data.len() + chunk.len(),
                    limit: self.limit,
                }
                .into());
            }
            data.extend_from_slice(&chunk);
        }

        debug!("Fetched {} bytes ({:?}) from {}", data.len(), content_type, url);
        Ok(RemoteMedia {
            data,
            content_type,
            url: url.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{http::header, routing::get, Router};
    use tokio::net::TcpListener;

    use crate::engine::fixture::{png_with, RED};

    /// Serve `/cat.png` on an ephemeral local port and return the base URL
    pub(crate) async fn serve_png() -> String {
        let png = png_with(32, 32, &[(RED, 4, 4, 8)]);
        let app = Router::new().route(
            "/cat.png",
            get(move || {
                let png = png.clone();
                async move { ([(header::CONTENT_TYPE, "image/png")], png) }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    pub(crate) fn local_fetcher(limit: usize) -> MediaFetcher {
        let client = Client::builder().no_proxy().build().unwrap();
        MediaFetcher::with_client(client, limit)
    }

    #[test]
    fn test_parse_media_url() {
        let url = parse_media_url(" https://example.com/clip.mp4 ").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert!(parse_media_url("http://10.0.0.2:8080/a.png").is_ok());
    }

    #[test]
    fn test_parse_media_url_rejects_malformed() {
        for raw in ["not a url", "ftp://example.com/a.png", "file:///etc/passwd", "http://", ""] {
            let err = parse_media_url(raw).unwrap_err();
            assert_eq!(err.code(), "INVALID_FIELD", "{}", raw);
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_type() {
        let base = serve_png().await;
        let url = parse_media_url(&format!("{}/cat.png", base)).unwrap();

        let media = local_fetcher(1 << 20).fetch(&url).await.unwrap();
        assert_eq!(media.content_type.as_deref(), Some("image/png"));
        assert!(image::load_from_memory(&media.data).is_ok());
    }

    #[tokio::test]
    async fn test_fetch_enforces_size_cap() {
        let base = serve_png().await;
        let url = parse_media_url(&format!("{}/cat.png", base)).unwrap();

        let err = local_fetcher(16).fetch(&url).await.unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_fetch_missing_resource_is_gateway_error() {
        let base = serve_png().await;
        let url = parse_media_url(&format!("{}/missing.png", base)).unwrap();

        let err = local_fetcher(1 << 20).fetch(&url).await.unwrap_err();
        assert_eq!(err.code(), "FETCH_FAILED");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
