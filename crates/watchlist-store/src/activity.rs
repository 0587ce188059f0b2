//! Suspicious activity logs reported by client devices.
//!
//! A log is one session on one device: who, where, and the list of actions
//! taken with their result. Logs are stored in the same SQLite file as the
//! gallery, newest first when listed.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::sqlite::open_connection;
use crate::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS activity_logs (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT    NOT NULL UNIQUE,
    timestamp    TEXT    NOT NULL,
    user_id      TEXT    NOT NULL,
    device_id    TEXT    NOT NULL,
    location     TEXT,
    session_name TEXT,
    actions      TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS activity_logs_timestamp ON activity_logs (timestamp);
";

/// How an attempted action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Allowed,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub resource: String,
    pub duration_seconds: f64,
    pub result: ActionResult,
}

/// A stored activity log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub actions: Vec<Action>,
}

/// A log as a client submits it, before validation.
#[derive(Debug, Deserialize)]
pub struct ActivityReport {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub location: Option<String>,
    pub session_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub actions: Option<Vec<Action>>,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("activity report is missing {0}")]
pub struct InvalidReport(pub &'static str);

impl ActivityReport {
    /// Check the required fields and assign an id. `now` is used when the
    /// report carries no timestamp.
    pub fn into_log(self, now: DateTime<Utc>) -> Result<ActivityLog, InvalidReport> {
        let user_id = required(self.user_id, "user_id")?;
        let device_id = required(self.device_id, "device_id")?;
        let actions = self.actions.ok_or(InvalidReport("actions"))?;

        Ok(ActivityLog {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: self.timestamp.unwrap_or(now),
            user_id,
            device_id,
            location: self.location,
            session_name: self.session_name,
            actions,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, InvalidReport> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(InvalidReport(field))
}

/// Activity logs in a single SQLite table.
pub struct SqliteActivityLog {
    conn: Mutex<Connection>,
}

impl SqliteActivityLog {
    /// Open (creating if needed) the activity table in the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(open_connection(path)?)
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

    pub fn insert(&self, log: &ActivityLog) -> Result<(), StoreError> {
        let actions = serde_json::to_string(&log.actions)?;
        self.conn()?.execute(
            "INSERT INTO activity_logs
                 (id, timestamp, user_id, device_id, location, session_name, actions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.id,
                encode_timestamp(&log.timestamp),
                log.user_id,
                log.device_id,
                log.location,
                log.session_name,
                actions,
            ],
        )?;

        tracing::info!(
            id = %log.id,
            user_id = %log.user_id,
            actions = log.actions.len(),
            "activity log saved"
        );
        Ok(())
    }

    /// Every log, newest timestamp first. Equal timestamps list the most
    /// recently stored first.
    pub fn list(&self) -> Result<Vec<ActivityLog>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, user_id, device_id, location, session_name, actions
             FROM activity_logs ORDER BY timestamp DESC, seq DESC",
        )?;
        let rows = stmt
            .query_map([], RawLog::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawLog::into_log).collect()
    }
}

struct RawLog {
    id: String,
    timestamp: String,
    user_id: String,
    device_id: String,
    location: Option<String>,
    session_name: Option<String>,
    actions: String,
}

impl RawLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            user_id: row.get(2)?,
            device_id: row.get(3)?,
            location: row.get(4)?,
            session_name: row.get(5)?,
            actions: row.get(6)?,
        })
    }

    fn into_log(self) -> Result<ActivityLog, StoreError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::BadTimestamp(format!("{}: {e}", self.timestamp)))?;
        Ok(ActivityLog {
            timestamp,
            actions: serde_json::from_str(&self.actions)?,
            id: self.id,
            user_id: self.user_id,
            device_id: self.device_id,
            location: self.location,
            session_name: self.session_name,
        })
    }
}

/// Fixed-width UTC so that text order is time order.
fn encode_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
