//! Per-session text log
//!
//! Every recording session writes a newline-delimited `.txt` log next to
//! its audio files. Writes are buffered and guarded by a short mutex so
//! diagnostics from the audio callbacks stay cheap. The log is capped at
//! 10 MiB per session; on overflow a single truncation marker is written
//! and everything after it is dropped.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Per-session size cap
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

struct LogFile {
    out: BufWriter<File>,
    written: u64,
    truncated: bool,
}

/// Cheaply cloneable handle to the session log; `close` is idempotent and
/// later writes become no-ops.
#[derive(Clone)]
pub struct SessionLog {
    inner: Arc<Mutex<Option<LogFile>>>,
}

impl SessionLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(LogFile {
                out: BufWriter::new(file),
                written: 0,
                truncated: false,
            }))),
        })
    }

    /// A log that discards everything; used when no session is active.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn info(&self, scope: &str, message: &str) {
        self.write_line("INFO", scope, message);
    }

    pub fn warn(&self, scope: &str, message: &str) {
        self.write_line("WARN", scope, message);
    }

    pub fn error(&self, scope: &str, message: &str) {
        self.write_line("ERROR", scope, message);
    }

    fn write_line(&self, level: &str, scope: &str, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[{}] {} {}: {}\n", timestamp, level, scope, message);

        let mut guard = self.inner.lock();
        let Some(log) = guard.as_mut() else {
            return;
        };
        if log.truncated {
            return;
        }
        if log.written + line.len() as u64 > MAX_LOG_BYTES {
            let _ = log.out.write_all(b"[LOG TRUNCATED]\n");
            log.truncated = true;
            return;
        }
        if log.out.write_all(line.as_bytes()).is_ok() {
            log.written += line.len() as u64;
        }
    }

    /// Flush and close the log file.
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        if let Some(mut log) = guard.take() {
            let _ = log.out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_line_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.txt");
        let log = SessionLog::create(&path).unwrap();
        log.info("writer", "started");
        log.warn("queue", "1 block dropped");
        log.close();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO writer: started"));
        assert!(lines[1].contains("WARN queue: 1 block dropped"));
        // "[YYYY-MM-DD HH:MM:SS.fff]" prefix
        assert!(lines[0].starts_with('['));
        assert_eq!(&lines[0][11..12], " ");
        assert_eq!(&lines[0][20..21], ".");
    }

    #[test]
    fn test_write_after_close_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.txt");
        let log = SessionLog::create(&path).unwrap();
        log.info("test", "one");
        log.close();
        log.info("test", "two");
        log.close();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn test_truncation_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.txt");
        let log = SessionLog::create(&path).unwrap();

        // ~90 bytes per line; 10 MiB needs > 120k lines
        let big = "x".repeat(4096);
        for _ in 0..3000 {
            log.info("flood", &big);
        }
        log.close();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.len() as u64 <= MAX_LOG_BYTES + 64);
        assert_eq!(contents.matches("[LOG TRUNCATED]").count(), 1);
        assert!(contents.trim_end().ends_with("[LOG TRUNCATED]"));
    }

    #[test]
    fn test_disabled_log_discards() {
        let log = SessionLog::disabled();
        log.info("anywhere", "nothing happens");
        log.close();
    }
}
