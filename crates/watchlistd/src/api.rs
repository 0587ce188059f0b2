use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use watchlist_core::{GalleryError, GalleryStore, SightingOutcome, SuspiciousRecord, UploadedImage};
use watchlist_store::{ActivityLog, ActivityReport, ErrorLog, SqliteActivityLog, UploadStore};

use crate::engine::{EngineError, EngineHandle, SightingRequest};
use crate::error::{ApiError, Result};

const GALLERY_UNAVAILABLE: &str = "Could not access the gallery.";
const STORE_UNAVAILABLE: &str = "Could not access the activity log store.";
const INVALID_LOG: &str = "Invalid log data provided.";

/// Shared state for all handlers.
pub struct AppState {
    pub engine: EngineHandle,
    pub gallery: Arc<dyn GalleryStore>,
    pub activity: Arc<SqliteActivityLog>,
    pub uploads: Arc<UploadStore>,
    pub error_log: Arc<ErrorLog>,
    pub threshold: f32,
}

impl AppState {
    /// Run blocking store work on the blocking pool. A failure is logged
    /// and becomes a 500 carrying `message`.
    async fn run_blocking<T, E, F>(
        &self,
        message: &'static str,
        public: &'static str,
        op: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        let err: anyhow::Error = match tokio::task::spawn_blocking(op).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.into(),
            Err(e) => e.into(),
        };
        let err = ApiError::internal(&self.error_log, message, public, &err).await;
        Err(err)
    }

    async fn with_gallery<T, F>(&self, message: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn GalleryStore) -> std::result::Result<T, GalleryError> + Send + 'static,
    {
        let gallery = self.gallery.clone();
        let work = move || op(gallery.as_ref());
        self.run_blocking(message, GALLERY_UNAVAILABLE, work).await
    }
}

/// Multipart form carrying one photo in the `photo` field.
#[derive(TryFromMultipart)]
pub struct PhotoForm {
    pub photo: Option<FieldData<Bytes>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegitimacyUpdate {
    pub is_legitimate: bool,
}

pub fn create_app(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/auth/authenticate", post(authenticate_handler))
        .route("/api/auth/suspicious", get(list_suspicious_handler))
        .route(
            "/api/auth/suspicious/{id}/legitimate",
            patch(legitimacy_handler),
        )
        .route("/api/upload", post(upload_handler))
        .route("/api/photos", get(list_photos_handler))
        .route("/api/photos/{id}", get(photo_handler))
        .route(
            "/api/logs/activity",
            post(capture_activity_handler).get(list_activity_handler),
        )
        .route("/api/status", get(status_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .with_state(state)
}

/// Check the `photo` field holds a recognisable image, then store it.
async fn accept_photo(state: &AppState, form: PhotoForm) -> Result<SightingRequest> {
    let FieldData { metadata, contents } =
        form.photo.ok_or(ApiError::Validation("No photo uploaded"))?;
    let image = UploadedImage::new(contents.to_vec(), metadata.content_type)
        .map_err(|_| ApiError::Validation("Uploaded file is not a supported image"))?;

    let uploads = state.uploads.clone();
    let original_name = metadata.file_name;
    let store = move || {
        let name = original_name.as_deref();
        uploads
            .save(image.bytes(), name, image.extension())
            .map(|source| (image, source))
    };
    let (image, source) = state
        .run_blocking("Upload failed", "Could not store the photo.", store)
        .await?;

    tracing::info!(
        filename = %source.filename,
        declared = ?image.declared_type(),
        sniffed = image.format().to_mime_type(),
        bytes = image.len(),
        "photo accepted"
    );

    Ok(SightingRequest { image, source })
}

fn engine_failure(
    state: &AppState,
    message: &'static str,
    err: EngineError,
) -> impl Future<Output = ApiError> + Send + 'static {
    ApiError::internal(&state.error_log, message, err.public_message(), &err)
}

/// Identify the person in an uploaded photo and wait for the result.
pub async fn authenticate_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(form): TypedMultipart<PhotoForm>,
) -> Result<(StatusCode, Json<Value>)> {
    let request = accept_photo(&state, form).await?;
    let outcome = match state.engine.identify(request).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(engine_failure(&state, "Authentication failed", e).await),
    };

    Ok(match outcome {
        SightingOutcome::Repeat { record, similarity } => (
            StatusCode::OK,
            Json(json!({
                "message": "Suspicious user detected again",
                "user": record,
                "similarity": similarity,
            })),
        ),
        SightingOutcome::New { record, .. } => (
            StatusCode::CREATED,
            Json(json!({
                "message": "New suspicious user added to database",
                "user": record,
            })),
        ),
    })
}

/// Accept a photo and process it in the background.
pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(form): TypedMultipart<PhotoForm>,
) -> Result<(StatusCode, Json<Value>)> {
    let request = accept_photo(&state, form).await?;
    let filename = request.source.filename.clone();

    if let Err(e) = state.engine.enqueue(request) {
        return Err(engine_failure(&state, "Upload failed", e).await);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Photo accepted for processing",
            "filename": filename,
        })),
    ))
}

/// All records, most-sighted first.
pub async fn list_suspicious_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SuspiciousRecord>>> {
    let mut records = state
        .with_gallery("Failed to fetch suspicious users", |g| g.all())
        .await?;
    records.sort_by(|a, b| b.sighting_count.cmp(&a.sighting_count));
    Ok(Json(records))
}

/// All records, most recently seen first.
pub async fn list_photos_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SuspiciousRecord>>> {
    let mut records = state
        .with_gallery("Failed to fetch photos", |g| g.all())
        .await?;
    records.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
    Ok(Json(records))
}

pub async fn photo_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuspiciousRecord>> {
    let record = state
        .with_gallery("Error fetching photo", move |g| g.get(&id))
        .await?;
    record
        .map(Json)
        .ok_or(ApiError::NotFound("Photo not found"))
}

/// Flag or unflag a record as a legitimate person.
pub async fn legitimacy_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<LegitimacyUpdate>,
) -> Result<Json<SuspiciousRecord>> {
    let updated = state
        .with_gallery("Failed to update suspicious user", move |g| {
            match g.set_legitimate(&id, update.is_legitimate) {
                Ok(record) => Ok(Some(record)),
                Err(GalleryError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await?;
    let record = updated.ok_or(ApiError::NotFound("Suspicious user not found"))?;

    tracing::info!(id = %record.id, legitimate = record.is_legitimate, "legitimacy updated");
    Ok(Json(record))
}

/// Validate a JSON activity report and give it an id and timestamp.
fn parse_activity(body: &[u8]) -> std::result::Result<ActivityLog, String> {
    let report: ActivityReport = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    report.into_log(Utc::now()).map_err(|e| e.to_string())
}

/// Store a suspicious activity log sent by a client device.
pub async fn capture_activity_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let log = parse_activity(&body).map_err(|reason| {
        tracing::debug!(%reason, "rejected activity report");
        ApiError::Validation(INVALID_LOG)
    })?;

    let activity = state.activity.clone();
    let save = move || activity.insert(&log).map(|()| log);
    let log = state
        .run_blocking("Failed to capture log.", STORE_UNAVAILABLE, save)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Log captured successfully.",
            "log": log,
        })),
    ))
}

/// Every activity log, newest first.
pub async fn list_activity_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ActivityLog>>> {
    let activity = state.activity.clone();
    let list = move || activity.list();
    let logs = state
        .run_blocking("Failed to fetch logs.", STORE_UNAVAILABLE, list)
        .await?;
    Ok(Json(logs))
}

pub async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let gallery_size = state
        .with_gallery("Failed to read status", |g| g.count())
        .await?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "gallerySize": gallery_size,
        "queueDepth": state.engine.queue_depth(),
        "similarityThreshold": state.threshold,
    })))
}
