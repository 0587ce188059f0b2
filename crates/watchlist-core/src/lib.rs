//! watchlist-core: photo to face signature, and gallery matching.
//!
//! Decodes uploads, locates faces with SCRFD, normalises the top face crop,
//! embeds it with an ONNX model via ONNX Runtime, and matches the resulting
//! signature against a gallery of previously seen people.

pub mod cancel;
pub mod crop;
pub mod detector;
pub mod embedder;
pub mod frame;
pub mod gallery;
pub mod models;
pub mod pipeline;
pub mod types;

use std::path::PathBuf;

pub use cancel::{CancelToken, Stage};
pub use frame::{RgbFrame, UploadedImage};
pub use gallery::{record_sighting, GalleryError, GalleryStore, MemoryGallery, SightingOutcome};
pub use models::{EmbeddingGenerator, FaceLocator, InitializationError, ModelRegistry};
pub use pipeline::{extract_signature, Extraction, PipelineError};
pub use types::{
    CosineMatcher, DetectedFace, MatchResult, Matcher, Signature, SourceImage, SuspiciousRecord,
    DEFAULT_SIMILARITY_THRESHOLD,
};

/// Per-user data directory, `$XDG_DATA_HOME/watchlist` or `~/.local/share/watchlist`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("watchlist")
}

/// Where the ONNX models live unless configured otherwise.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
