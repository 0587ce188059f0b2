//! watchlist-store: durable state for the watchlist daemon and CLI.
//!
//! Provides the SQLite gallery and activity logs, the append-only failure
//! log and on-disk storage for accepted uploads.

pub mod activity;
pub mod error_log;
pub mod sqlite;
pub mod uploads;

pub use activity::{
    Action, ActionResult, ActivityLog, ActivityReport, InvalidReport, SqliteActivityLog,
};
pub use error_log::ErrorLog;
pub use sqlite::SqliteGallery;
pub use uploads::{UploadError, UploadStore};

use thiserror::Error;
use watchlist_core::GalleryError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record {id} has a corrupt signature blob ({len} bytes)")]
    CorruptSignature { id: String, len: usize },
    #[error("bad timestamp {0}")]
    BadTimestamp(String),
    #[error("database lock poisoned")]
    Poisoned,
}

impl From<StoreError> for GalleryError {
    fn from(e: StoreError) -> Self {
        GalleryError::Backend(Box::new(e))
    }
}
