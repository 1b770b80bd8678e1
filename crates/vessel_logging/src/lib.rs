//! Shared logging utilities for Vessel binaries.
//!
//! Container sessions are short and chatty around spawn/dispose, so the
//! file writer is segment-based: one active `<app>.log`, rolled into
//! timestamped archives when it fills, with only a handful of archives
//! retained.

use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "vessel=info,vessel_host=info,vessel_worker=info";
/// Archived segments retained per binary.
const MAX_ARCHIVED_SEGMENTS: usize = 4;
/// Segment size at which the active file rolls (10 MiB).
const MAX_SEGMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by Vessel binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a segmented file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = LogHandle::open(log_dir, config.app_name)?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Resolve the Vessel home directory.
///
/// Priority: VESSEL_HOME override, then the platform home directory.
pub fn vessel_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("VESSEL_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".vessel")
}

/// Logs directory: `$VESSEL_HOME/logs`
pub fn logs_dir() -> PathBuf {
    vessel_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-gated segment writer.
///
/// Appends to `<app>.log`; once a write would push the segment past the
/// byte limit, the segment is archived as `<app>-<millis>-<seq>.log`, the
/// oldest archives beyond the retention count are deleted, and a fresh
/// active segment is opened. A failed archive rename is tolerated: the
/// writer keeps appending to the oversized segment rather than dropping
/// log lines.
struct SegmentWriter {
    dir: PathBuf,
    app_name: String,
    max_bytes: u64,
    max_archives: usize,
    active: Option<fs::File>,
    written: u64,
    rolls: u64,
}

impl SegmentWriter {
    fn open(dir: PathBuf, app_name: &str, max_bytes: u64, max_archives: usize) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut writer = Self {
            dir,
            app_name: archive_safe(app_name),
            max_bytes: max_bytes.max(1),
            max_archives,
            active: None,
            written: 0,
            rolls: 0,
        };
        writer.activate()?;
        Ok(writer)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.app_name))
    }

    fn archive_path(&self) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        // The roll counter disambiguates archives landing in one
        // millisecond; zero-padding keeps name order = age order.
        self.dir
            .join(format!("{}-{:013}-{:03}.log", self.app_name, stamp, self.rolls))
    }

    fn activate(&mut self) -> io::Result<()> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = file.metadata()?.len();
        self.active = Some(file);
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        self.active = None;
        self.rolls += 1;
        if fs::rename(self.active_path(), self.archive_path()).is_ok() {
            self.prune_archives();
        }
        self.activate()
    }

    fn prune_archives(&self) {
        let prefix = format!("{}-", self.app_name);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut archives: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".log"))
            })
            .collect();
        archives.sort();
        while archives.len() > self.max_archives {
            let _ = fs::remove_file(archives.remove(0));
        }
    }
}

impl Write for SegmentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        match self.active.as_mut() {
            Some(file) => {
                let bytes = file.write(buf)?;
                self.written += bytes as u64;
                Ok(bytes)
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no active log segment",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.active.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Cloneable handle given to the tracing layer.
#[derive(Clone)]
struct LogHandle {
    inner: Arc<Mutex<SegmentWriter>>,
}

impl LogHandle {
    fn open(dir: PathBuf, app_name: &str) -> Result<Self> {
        let writer = SegmentWriter::open(dir, app_name, MAX_SEGMENT_BYTES, MAX_ARCHIVED_SEGMENTS)
            .with_context(|| format!("Failed to open log segment for {}", app_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(writer)),
        })
    }
}

/// One writer lease; locks the shared segment per call.
struct LogSink {
    inner: Arc<Mutex<SegmentWriter>>,
}

impl LogSink {
    /// A poisoned lock means some thread panicked mid-write; the
    /// segment state is still usable, so keep logging.
    fn writer(&self) -> std::sync::MutexGuard<'_, SegmentWriter> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogHandle {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        LogSink {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn archive_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "vessel".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn full_segment_rolls_into_a_timestamped_archive() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path().to_path_buf(), "vessel", 32, 4).unwrap();

        writer.write_all(&[b'a'; 24]).unwrap();
        writer.write_all(&[b'b'; 24]).unwrap();
        writer.flush().unwrap();

        assert!(dir.path().join("vessel.log").exists());
        let archives: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("vessel-"))
            .collect();
        assert_eq!(archives.len(), 1);
    }

    #[test]
    fn old_archives_are_pruned_to_the_retention_count() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path().to_path_buf(), "vessel", 32, 2).unwrap();

        for _ in 0..6 {
            writer.write_all(&[b'x'; 24]).unwrap();
        }
        writer.flush().unwrap();

        let archives: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("vessel-"))
            .collect();
        assert!(archives.len() <= 2, "kept {} archives", archives.len());
        assert!(dir.path().join("vessel.log").exists());
    }

    #[test]
    fn archive_safe_replaces_path_characters() {
        assert_eq!(archive_safe("vessel/run"), "vessel-run");
        assert_eq!(archive_safe("vessel-run_1"), "vessel-run_1");
        assert_eq!(archive_safe(""), "vessel");
    }
}
