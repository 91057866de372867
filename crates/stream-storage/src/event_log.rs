//! Session event log (`<base>_eventlog.dat`).
//!
//! One tab-separated row per event: wall-clock timestamp, seconds since the
//! session started, the last received frame index and a free-form message.
//! The first event of a session is preceded by a synthetic
//! `Recording started` row; a fresh log also gets a column header, while an
//! appended log is separated from the previous session by a blank line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::path::remove_if_exists;

/// Column header of a fresh log.
pub const EVENT_LOG_HEADER: &str = "# Timestamp\tElapsed\tFrame\tMessage";

fn unix_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Event log of one save session.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    start_time: DateTime<Utc>,
    append: bool,
    started: bool,
}

impl EventLog {
    /// Log at `path` for a session started at `start_time`.
    ///
    /// Nothing touches the disk until the first entry is written.
    pub fn new(path: impl Into<PathBuf>, start_time: DateTime<Utc>, append: bool) -> Self {
        Self {
            path: path.into(),
            start_time,
            append,
            started: false,
        }
    }

    /// Log location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an entry has been written this session.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Append `message` stamped with the current time.
    pub fn write(
        &mut self,
        message: &str,
        first_frame_index: Option<u64>,
        last_frame_index: Option<u64>,
    ) -> std::io::Result<()> {
        self.write_at(Utc::now(), message, first_frame_index, last_frame_index)
    }

    /// Append `message` stamped with `now`.
    pub fn write_at(
        &mut self,
        now: DateTime<Utc>,
        message: &str,
        first_frame_index: Option<u64>,
        last_frame_index: Option<u64>,
    ) -> std::io::Result<()> {
        let mut text = String::new();
        if !self.started {
            if self.path.exists() {
                if self.append {
                    text.push_str("\n\n");
                } else {
                    remove_if_exists(&self.path)?;
                    text.push_str(EVENT_LOG_HEADER);
                    text.push('\n');
                }
            } else {
                text.push_str(EVENT_LOG_HEADER);
                text.push('\n');
            }
            text.push_str(&format!(
                "{:.3}\t{:.3}\t{}\t{}\n",
                unix_seconds(self.start_time),
                0.0,
                first_frame_index.unwrap_or(0),
                "Recording started"
            ));
        }
        let elapsed = (now - self.start_time).num_milliseconds() as f64 / 1000.0;
        text.push_str(&format!(
            "{:.3}\t{:.3}\t{}\t{}\n",
            unix_seconds(now),
            elapsed,
            last_frame_index.unwrap_or(0),
            message
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        self.started = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_first_entry_has_header_and_start_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.dat");
        let mut log = EventLog::new(&path, t0(), false);
        log.write_at(t0() + Duration::milliseconds(1500), "shutter open", Some(3), Some(42))
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], EVENT_LOG_HEADER);
        assert_eq!(lines[1], "1700000000.000\t0.000\t3\tRecording started");
        assert_eq!(lines[2], "1700000001.500\t1.500\t42\tshutter open");
        assert!(log.is_started());
    }

    #[test]
    fn test_append_separates_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.dat");
        let mut first = EventLog::new(&path, t0(), false);
        first.write_at(t0(), "Recording stopped", None, None).unwrap();

        let mut second = EventLog::new(&path, t0(), true);
        second.write_at(t0(), "marker", None, Some(1)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches(EVENT_LOG_HEADER).count(), 1);
        assert!(text.contains("Recording stopped\n\n\n"));
        assert_eq!(text.matches("Recording started").count(), 2);
    }

    #[test]
    fn test_overwrite_without_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.dat");
        std::fs::write(&path, "old content\n").unwrap();
        let mut log = EventLog::new(&path, t0(), false);
        log.write_at(t0(), "x", None, None).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("old content"));
        assert!(text.starts_with(EVENT_LOG_HEADER));
    }
}
