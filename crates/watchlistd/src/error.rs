use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use watchlist_store::ErrorLog;

/// API error, rendered as a JSON body.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or unusable input (400).
    Validation(&'static str),
    /// Unknown record id (404).
    NotFound(&'static str),
    /// Anything else (500). Raw detail stays in the logs under `correlation_id`.
    Internal {
        message: &'static str,
        public: &'static str,
        correlation_id: String,
    },
}

impl ApiError {
    /// Log `detail` under a fresh correlation id and build the client-facing error.
    ///
    /// The error log append runs on the blocking pool; the returned future
    /// resolves once the entry is written.
    pub fn internal(
        log: &Arc<ErrorLog>,
        message: &'static str,
        public: &'static str,
        detail: &dyn Display,
    ) -> impl Future<Output = Self> + Send + 'static {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(%correlation_id, error = %detail, "{message}");

        let log = log.clone();
        let context = format!("{message} [{correlation_id}]");
        let detail = detail.to_string();
        async move {
            let append = tokio::task::spawn_blocking(move || log.record(&context, &detail));
            if let Err(e) = append.await {
                tracing::warn!(error = %e, "error log append did not run");
            }
            ApiError::Internal {
                message,
                public,
                correlation_id,
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => {
                let body = Json(json!({ "message": message }));
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            ApiError::NotFound(message) => {
                let body = Json(json!({ "message": message }));
                (StatusCode::NOT_FOUND, body).into_response()
            }
            ApiError::Internal {
                message,
                public,
                correlation_id,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "message": message,
                    "error": public,
                    "correlationId": correlation_id,
                })),
            )
                .into_response(),
        }
    }
}

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_internal_writes_log_before_resolving() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ErrorLog::new(dir.path().join("error.log")));

        let pending = ApiError::internal(&log, "Upload failed", "No space.", &"disk full");
        let err = pending.await;
        let ApiError::Internal { correlation_id, .. } = &err else {
            panic!("expected an internal error, got {err:?}");
        };

        let content = std::fs::read_to_string(log.path()).unwrap();
        let expected = format!(" - Upload failed [{correlation_id}]: disk full\n");
        assert!(content.ends_with(&expected), "{content}");
    }

    #[tokio::test]
    async fn test_internal_body_is_opaque() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ErrorLog::new(dir.path().join("error.log")));
        let response = ApiError::internal(&log, "Failed", "Try again later.", &"/etc/secret")
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Try again later.");
        assert!(!body.to_string().contains("/etc/secret"));
    }
}
