//! Best-effort append-only failure log.
//!
//! One line per failure: `<RFC 3339 timestamp> - <context>: <message>`.
//! Writing never fails from the caller's point of view.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct ErrorLog {
    path: PathBuf,
    // Serialises writers so concurrent lines never interleave.
    write_lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Failures to write are reported through tracing only.
    pub fn record(&self, context: &str, error: &dyn Display) {
        let line = format_entry(Utc::now(), context, &error.to_string());
        if let Err(e) = self.append(&line) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "could not write error log entry"
            );
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

/// Render a single log line, newline-terminated.
pub fn format_entry(at: DateTime<Utc>, context: &str, message: &str) -> String {
    let flat: String = message
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!(
        "{} - {}: {}\n",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        context,
        flat
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_entry() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            format_entry(at, "upload 17.jpg", "no face detected"),
            "2025-03-01T12:30:05.000Z - upload 17.jpg: no face detected\n"
        );
    }

    #[test]
    fn test_format_entry_stays_on_one_line() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let line = format_entry(at, "ctx", "first\nsecond\r\nthird");
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with("first second  third\n"));
    }

    #[test]
    fn test_record_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("error.log"));
        log.record("a", &"boom");
        log.record("b", &"bang");

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - a: boom"));
        assert!(lines[1].ends_with(" - b: bang"));
    }

    #[test]
    fn test_record_swallows_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append.
        let log = ErrorLog::new(dir.path());
        log.record("ctx", &"ignored");
    }
}
