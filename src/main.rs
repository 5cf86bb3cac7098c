//! Image Analyzer Service
//!
//! Counts objects of a requested label in uploaded images and videos with an
//! OpenVINO-accelerated YOLO detector, served over a REST API.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use image_analyzer::api::{create_rest_router, AppState};
use image_analyzer::config::Config;
use image_analyzer::engine::ModelRegistry;
use image_analyzer::service::AnalyzerService;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = Config::default_path();
    // A missing file means defaults; a malformed one is fatal
    let loaded = Config::load_optional(&config_path)
        .with_context(|| format!("failed to load config {}", config_path))?;
    let from_file = loaded.is_some();
    let mut config = loaded.unwrap_or_default();
    config.apply_env();

    // Initialize logging
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting Image Analyzer v{}", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!("Configuration loaded from {}", config_path);
    } else {
        warn!("{} not found, using default config", config_path);
    }
    config.validate().context("invalid configuration")?;

    info!("Configuration:");
    info!("  Listen: {}:{}", config.server.host, config.server.port);
    info!("  Device: {}", config.inference.device);
    for model in &config.models {
        info!("  Model: {} ({}) {}", model.name, model.family, model.path.display());
    }
    info!("  Default confidence: {}", config.analysis.default_confidence);
    info!("  Max frames: {}", config.analysis.max_frames);
    info!("  Request timeout: {}s", config.analysis.request_timeout_secs);

    // Models are loaded once, before the listener binds
    let registry = ModelRegistry::load(&config).context("failed to load models")?;
    info!("{} model(s) ready, default: {}", registry.len(), registry.default_name());

    let service = Arc::new(AnalyzerService::new(Arc::new(registry), &config));
    let router = create_rest_router(Arc::new(AppState::new(service)));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("REST API listening on http://{}", addr);
    info!("Docs: http://localhost:{}/docs", config.server.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining requests...");
}
