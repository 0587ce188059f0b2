use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use watchlist_core::ModelRegistry;
use watchlist_store::{ErrorLog, SqliteActivityLog, SqliteGallery, UploadStore};

mod api;
mod config;
mod engine;
mod error;
mod queue;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "watchlistd starting");

    let config = config::Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    // Models are loaded once; a missing or broken model stops startup.
    let models = ModelRegistry::load_onnx(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.embedder_input_size,
    )
    .context("failed to initialise face models")?;

    let db_error = || format!("failed to open database at {}", config.db_path.display());
    let gallery = Arc::new(SqliteGallery::open(&config.db_path).with_context(db_error)?);
    let activity = SqliteActivityLog::open(&config.db_path)
        .map(Arc::new)
        .with_context(db_error)?;
    let error_log = Arc::new(ErrorLog::new(&config.error_log_path));

    let engine = engine::EngineHandle::start(
        models,
        gallery.clone(),
        config.similarity_threshold,
        config.task_timeout(),
        error_log.clone(),
    )
    .context("failed to start engine worker")?;

    let state = Arc::new(api::AppState {
        engine,
        gallery,
        activity,
        uploads: Arc::new(UploadStore::new(&config.upload_dir, "/uploads")),
        error_log,
        threshold: config.similarity_threshold,
    });
    let app = api::create_app(state, config.max_upload_bytes);

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "watchlistd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("watchlistd shutting down");
        })
        .await?;

    Ok(())
}
