//! SQLite-backed gallery.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use watchlist_core::{GalleryError, GalleryStore, Signature, SuspiciousRecord};

use crate::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS suspicious (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT    NOT NULL UNIQUE,
    filename       TEXT    NOT NULL,
    storage_path   TEXT    NOT NULL,
    signature      BLOB    NOT NULL,
    sighting_count INTEGER NOT NULL DEFAULT 1,
    is_legitimate  INTEGER NOT NULL DEFAULT 0,
    first_seen_at  TEXT    NOT NULL,
    last_seen_at   TEXT    NOT NULL
);
";

const COLUMNS: &str = "id, filename, storage_path, signature, sighting_count, is_legitimate, \
                       first_seen_at, last_seen_at";

/// Other connections to the same file (the activity log) may hold the write
/// lock briefly.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the database file at `path`, creating its directory if needed.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Gallery stored in a single SQLite table, scanned in insertion order.
pub struct SqliteGallery {
    conn: Mutex<Connection>,
}

impl SqliteGallery {
    /// Open (creating if needed) the gallery database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        tracing::info!(path = %path.display(), "gallery database opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn load_all(&self) -> Result<Vec<SuspiciousRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM suspicious ORDER BY seq"))?;
        let rows = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    fn load_one(&self, id: &str) -> Result<Option<SuspiciousRecord>, StoreError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM suspicious WHERE id = ?1"),
                params![id],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn insert_record(&self, r: &SuspiciousRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            &format!("INSERT INTO suspicious ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                r.id,
                r.filename,
                r.storage_path,
                encode_signature(&r.signature),
                r.sighting_count,
                r.is_legitimate,
                encode_time(&r.first_seen_at),
                encode_time(&r.last_seen_at),
            ],
        )?;
        Ok(())
    }

    fn update_sighting(&self, r: &SuspiciousRecord) -> Result<usize, StoreError> {
        Ok(self.conn()?.execute(
            "UPDATE suspicious SET sighting_count = ?1, last_seen_at = ?2 WHERE id = ?3",
            params![r.sighting_count, encode_time(&r.last_seen_at), r.id],
        )?)
    }

    fn update_legitimate(&self, id: &str, legitimate: bool) -> Result<usize, StoreError> {
        Ok(self.conn()?.execute(
            "UPDATE suspicious SET is_legitimate = ?1 WHERE id = ?2",
            params![legitimate, id],
        )?)
    }
}

impl GalleryStore for SqliteGallery {
    fn all(&self) -> Result<Vec<SuspiciousRecord>, GalleryError> {
        Ok(self.load_all()?)
    }

    fn get(&self, id: &str) -> Result<Option<SuspiciousRecord>, GalleryError> {
        Ok(self.load_one(id)?)
    }

    fn insert(&self, record: &SuspiciousRecord) -> Result<(), GalleryError> {
        Ok(self.insert_record(record)?)
    }

    fn save_sighting(&self, record: &SuspiciousRecord) -> Result<(), GalleryError> {
        match self.update_sighting(record)? {
            0 => Err(GalleryError::NotFound(record.id.clone())),
            _ => Ok(()),
        }
    }

    fn set_legitimate(&self, id: &str, legitimate: bool) -> Result<SuspiciousRecord, GalleryError> {
        if self.update_legitimate(id, legitimate)? == 0 {
            return Err(GalleryError::NotFound(id.to_string()));
        }
        self.load_one(id)?
            .ok_or_else(|| GalleryError::NotFound(id.to_string()))
    }

    fn count(&self) -> Result<usize, GalleryError> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM suspicious", [], |row| row.get(0))
            .map_err(StoreError::from)?;
        Ok(n as usize)
    }
}

/// Columns as stored, before signature/timestamp decoding.
struct RawRecord {
    id: String,
    filename: String,
    storage_path: String,
    signature: Vec<u8>,
    sighting_count: u32,
    is_legitimate: bool,
    first_seen_at: String,
    last_seen_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            storage_path: row.get(2)?,
            signature: row.get(3)?,
            sighting_count: row.get(4)?,
            is_legitimate: row.get(5)?,
            first_seen_at: row.get(6)?,
            last_seen_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<SuspiciousRecord, StoreError> {
        Ok(SuspiciousRecord {
            signature: decode_signature(&self.id, &self.signature)?,
            first_seen_at: decode_time(&self.first_seen_at)?,
            last_seen_at: decode_time(&self.last_seen_at)?,
            id: self.id,
            filename: self.filename,
            storage_path: self.storage_path,
            sighting_count: self.sighting_count,
            is_legitimate: self.is_legitimate,
        })
    }
}

/// Signatures are stored as little-endian f32 bytes.
fn encode_signature(sig: &Signature) -> Vec<u8> {
    sig.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_signature(id: &str, bytes: &[u8]) -> Result<Signature, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::CorruptSignature {
            id: id.to_string(),
            len: bytes.len(),
        });
    }
    Ok(Signature::new(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    ))
}

fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn decode_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::BadTimestamp(format!("{s}: {e}")))
}
