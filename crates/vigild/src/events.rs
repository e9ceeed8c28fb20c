//! Append-only detection and lifecycle event log.
//!
//! One line per event: `<timestamp> - <SEVERITY> - <message>`. Every event is
//! also mirrored to `tracing` at the matching level.

use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub at: DateTime<Local>,
    pub severity: Severity,
    pub message: String,
}

impl Event {
    pub fn now(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            at: Local::now(),
            severity,
            message: message.into(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}",
            self.at.format("%Y-%m-%d %H:%M:%S,%3f"),
            self.severity,
            self.message
        )
    }
}

/// Destination for events.
pub trait EventSink {
    fn record(&mut self, event: Event);
    fn flush(&mut self);
}

/// Line-oriented sink over any writer.
pub struct LineEventLog<W: Write> {
    writer: W,
}

impl LineEventLog<BufWriter<File>> {
    /// Create `detection_log_<YYYYMMDD_HHMMSS>.log` under `dir`.
    pub fn create_in(dir: &Path, started: DateTime<Local>) -> io::Result<(Self, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("detection_log_{}.log", started.format("%Y%m%d_%H%M%S")));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((Self::new(BufWriter::new(file)), path))
    }
}

impl<W: Write> LineEventLog<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for LineEventLog<W> {
    fn record(&mut self, event: Event) {
        match event.severity {
            Severity::Info => tracing::info!(target: "vigil::events", "{}", event.message),
            Severity::Warning => tracing::warn!(target: "vigil::events", "{}", event.message),
            Severity::Error => tracing::error!(target: "vigil::events", "{}", event.message),
        }
        if let Err(e) = writeln!(self.writer, "{event}") {
            tracing::error!(error = %e, "failed to append to event log");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::error!(error = %e, "failed to flush event log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_line_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let event = Event {
            at,
            severity: Severity::Warning,
            message: "Blacklisted person detected: Alice".into(),
        };
        assert_eq!(
            event.to_string(),
            "2024-03-05 14:07:09,000 - WARNING - Blacklisted person detected: Alice"
        );
    }

    #[test]
    fn test_sink_appends_one_line_per_event() {
        let mut log = LineEventLog::new(Vec::new());
        log.record(Event::now(Severity::Info, "Unknown person detected."));
        log.record(Event::now(Severity::Error, "Failed to read frame from camera."));
        log.flush();

        let text = String::from_utf8(log.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - INFO - Unknown person detected."));
        assert!(lines[1].contains(" - ERROR - "));
    }

    #[test]
    fn test_create_in_names_file_by_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let (mut log, path) = LineEventLog::create_in(&dir.path().join("logs"), started).unwrap();
        log.record(Event::now(Severity::Info, "started"));
        log.flush();

        assert_eq!(path.file_name().unwrap(), "detection_log_20240102_030405.log");
        assert!(std::fs::read_to_string(&path).unwrap().contains("INFO - started"));
    }
}
