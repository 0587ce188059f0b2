use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use watchlist_core::embedder::DEFAULT_EMBEDDER_INPUT_SIZE;
use watchlist_core::DEFAULT_SIMILARITY_THRESHOLD;

const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;
/// Longest accepted per-task deadline. Larger values are clamped.
const MAX_TASK_TIMEOUT_SECS: u64 = 3600;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: 0.0.0.0:5000).
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detection model file name inside `model_dir`.
    pub detector_model: String,
    /// Embedding model file name inside `model_dir`.
    pub embedder_model: String,
    /// Square input side of the embedding model.
    pub embedder_input_size: u32,
    /// Path to the SQLite database (gallery and activity logs).
    pub db_path: PathBuf,
    /// Directory accepted photos are written to.
    pub upload_dir: PathBuf,
    /// Append-only failure log.
    pub error_log_path: PathBuf,
    /// Cosine similarity at or above which two signatures are the same person.
    pub similarity_threshold: f32,
    /// Run-time budget of a single inference task, counted from when the
    /// worker picks it up.
    pub task_timeout_secs: u64,
    /// Upper bound on request bodies.
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from `WATCHLIST_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Unusable values fall
    /// back to their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let data_dir = watchlist_core::default_data_dir();

        let threshold = parse_var(
            &lookup,
            "WATCHLIST_SIMILARITY_THRESHOLD",
            DEFAULT_SIMILARITY_THRESHOLD,
        );
        let timeout = parse_var(
            &lookup,
            "WATCHLIST_TASK_TIMEOUT_SECS",
            DEFAULT_TASK_TIMEOUT_SECS,
        );

        Self {
            bind: parse_var(&lookup, "WATCHLIST_BIND", default_bind()),
            model_dir: path("WATCHLIST_MODEL_DIR")
                .unwrap_or_else(watchlist_core::default_model_dir),
            detector_model: string("WATCHLIST_DETECTOR_MODEL", "det_500m.onnx"),
            embedder_model: string("WATCHLIST_EMBEDDER_MODEL", "mobilenet_v2.onnx"),
            embedder_input_size: parse_var(
                &lookup,
                "WATCHLIST_EMBEDDER_INPUT",
                DEFAULT_EMBEDDER_INPUT_SIZE,
            ),
            db_path: path("WATCHLIST_DB_PATH")
                .unwrap_or_else(|| data_dir.join("gallery.db")),
            upload_dir: path("WATCHLIST_UPLOAD_DIR")
                .unwrap_or_else(|| PathBuf::from("uploads")),
            error_log_path: path("WATCHLIST_ERROR_LOG")
                .unwrap_or_else(|| PathBuf::from("error.log")),
            similarity_threshold: checked_threshold(threshold),
            task_timeout_secs: checked_timeout(timeout),
            max_upload_bytes: parse_var(&lookup, "WATCHLIST_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn parse_var<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparsable setting, using the default");
            default
        }
    }
}

/// Cosine similarity lives in [-1, 1]. Anything else, NaN included, is
/// replaced by the default.
fn checked_threshold(value: f32) -> f32 {
    if value.is_finite() && (-1.0..=1.0).contains(&value) {
        return value;
    }
    tracing::warn!(
        value,
        default = DEFAULT_SIMILARITY_THRESHOLD,
        "similarity threshold must be a number in [-1, 1], using the default"
    );
    DEFAULT_SIMILARITY_THRESHOLD
}

/// A zero budget would fail every task; an enormous one is clamped.
fn checked_timeout(secs: u64) -> u64 {
    if secs == 0 {
        tracing::warn!(
            default = DEFAULT_TASK_TIMEOUT_SECS,
            "task timeout of 0s, using the default"
        );
        return DEFAULT_TASK_TIMEOUT_SECS;
    }
    if secs > MAX_TASK_TIMEOUT_SECS {
        tracing::warn!(
            secs,
            max = MAX_TASK_TIMEOUT_SECS,
            "task timeout too large, clamping"
        );
        return MAX_TASK_TIMEOUT_SECS;
    }
    secs
}
