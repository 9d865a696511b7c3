//! Rotating file log: a `tracing` layer that writes `log<N>.txt` files in a ring, and the
//! log sink that bundles them for a peer's `getLogs`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pairlink_core::LogSink;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const BUNDLE_NAME: &str = "log_bundle.txt";

struct Ring {
    dir: PathBuf,
    max_files: usize,
    max_bytes: u64,
    index: usize,
    file: File,
    written: u64,
}

impl Ring {
    fn path(&self, index: usize) -> PathBuf {
        file_path(&self.dir, index)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.written > 0 && self.written + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.written += line.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index = (self.index + 1) % self.max_files;
        self.file = create_truncated(&self.path(self.index))?;
        self.written = 0;
        Ok(())
    }

    /// Existing log files, oldest first: the ring starting just after the current file.
    fn files_oldest_first(&self) -> Vec<PathBuf> {
        (1..=self.max_files)
            .map(|k| self.path((self.index + k) % self.max_files))
            .filter(|p| p.exists())
            .collect()
    }
}

fn file_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("log{}.txt", index))
}

fn create_truncated(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// Index of the most recently written `log<N>.txt` in `dir`, by modification time.
fn last_used_index(dir: &Path, max_files: usize) -> Option<usize> {
    (0..max_files)
        .filter_map(|i| {
            let modified = fs::metadata(file_path(dir, i)).ok()?.modified().ok()?;
            Some((modified, i))
        })
        .max()
        .map(|(_, i)| i)
}

/// Shared handle to the log ring. Clones write to the same files.
#[derive(Clone)]
pub struct RotatingLog {
    ring: Arc<Mutex<Ring>>,
}

impl RotatingLog {
    /// Open the ring in `dir`, starting one index past the last file used.
    pub fn open(dir: &Path, max_files: usize, max_bytes: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let max_files = max_files.max(1);
        let index = last_used_index(dir, max_files).map_or(0, |i| (i + 1) % max_files);
        let file = create_truncated(&file_path(dir, index))?;
        Ok(Self {
            ring: Arc::new(Mutex::new(Ring {
                dir: dir.to_path_buf(),
                max_files,
                max_bytes: max_bytes.max(1),
                index,
                file,
                written: 0,
            })),
        })
    }

    pub fn layer(&self) -> FileLogLayer {
        FileLogLayer { log: self.clone() }
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        let ring = self.ring.lock().ok()?;
        Some(ring.path(ring.index))
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut ring) = self.ring.lock() {
            let _ = ring.write_line(line);
        }
    }

    /// Concatenate the log files oldest-first into `log_bundle.txt`. `Ok(None)` when there
    /// is nothing to bundle. Holds no lock while the bundle is written.
    pub fn bundle(&self) -> io::Result<Option<PathBuf>> {
        let (dir, files) = {
            let mut ring = self
                .ring
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "log ring poisoned"))?;
            ring.file.flush()?;
            (ring.dir.clone(), ring.files_oldest_first())
        };
        if files.is_empty() {
            return Ok(None);
        }
        let out_path = dir.join(BUNDLE_NAME);
        let mut out = create_truncated(&out_path)?;
        for path in &files {
            let mut f = File::open(path)?;
            io::copy(&mut f, &mut out)?;
        }
        out.flush()?;
        Ok(Some(out_path))
    }
}

impl LogSink for RotatingLog {
    fn produce_bundle(&mut self) -> Option<PathBuf> {
        match self.bundle() {
            Ok(Some(path)) => Some(path),
            Ok(None) => {
                tracing::warn!("no log files to bundle");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bundle logs");
                None
            }
        }
    }
}

struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn push(&mut self, name: &str, value: &str) {
        if name == "message" {
            if self.message.is_empty() {
                self.message = value.to_owned();
            } else {
                self.message = format!("{} {}", value, self.message);
            }
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(&format!("{}={}", name, value));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field.name(), &format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field.name(), value);
    }
}

/// Writes each event as one line into the ring.
pub struct FileLogLayer {
    log: RotatingLog,
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let level = match *meta.level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };
        let line = format!(
            "[{}] {} {}: {}\n",
            timestamp(),
            level,
            meta.target(),
            visitor.message
        );
        self.log.write_line(&line);
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Local date and time, millisecond precision.
fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn rotates_when_file_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingLog::open(dir.path(), 3, 10).unwrap();
        log.write_line("aaaaaaaa\n");
        log.write_line("bbbbbbbb\n");
        log.write_line("cccccccc\n");
        assert_eq!(read(&dir.path().join("log0.txt")), "aaaaaaaa\n");
        assert_eq!(read(&dir.path().join("log1.txt")), "bbbbbbbb\n");
        assert_eq!(log.current_file(), Some(dir.path().join("log2.txt")));
    }

    #[test]
    fn ring_wraps_and_overwrites_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingLog::open(dir.path(), 2, 4).unwrap();
        for line in ["one\n", "two\n", "six\n"] {
            log.write_line(line);
        }
        assert_eq!(log.current_file(), Some(dir.path().join("log0.txt")));
        assert_eq!(read(&dir.path().join("log0.txt")), "six\n");
        assert!(!dir.path().join("log2.txt").exists());
    }

    #[test]
    fn bundle_is_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingLog::open(dir.path(), 3, 6).unwrap();
        for line in ["1111\n", "2222\n", "3333\n", "4444\n"] {
            log.write_line(line);
        }
        let path = log.bundle().unwrap().unwrap();
        assert_eq!(path, dir.path().join(BUNDLE_NAME));
        assert_eq!(read(&path), "2222\n3333\n4444\n");
    }

    #[test]
    fn reopen_starts_after_last_used() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RotatingLog::open(dir.path(), 10, 1_000_000).unwrap();
            log.write_line("first run\n");
        }
        let log = RotatingLog::open(dir.path(), 10, 1_000_000).unwrap();
        assert_eq!(log.current_file(), Some(dir.path().join("log1.txt")));
        assert_eq!(read(&dir.path().join("log0.txt")), "first run\n");
    }

    #[test]
    fn sink_produces_bundle_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RotatingLog::open(dir.path(), 2, 100).unwrap();
        log.write_line("hello\n");
        assert_eq!(log.produce_bundle(), Some(dir.path().join(BUNDLE_NAME)));
    }

    #[test]
    fn layer_writes_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingLog::open(dir.path(), 2, 10_000).unwrap();
        let subscriber = tracing_subscriber::registry().with(log.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(attempt = 3, "starting external session");
        });
        let text = read(&dir.path().join("log0.txt"));
        assert!(text.contains("INFO"));
        assert!(text.contains("starting external session attempt=3"));
    }

    #[test]
    fn lines_carry_full_date_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingLog::open(dir.path(), 2, 10_000).unwrap();
        let subscriber = tracing_subscriber::registry().with(log.layer());
        tracing::subscriber::with_default(subscriber, || tracing::warn!("link lost"));
        let text = read(&dir.path().join("log0.txt"));
        let stamp = text
            .strip_prefix('[')
            .and_then(|rest| rest.split(']').next())
            .unwrap();
        assert_eq!(stamp.len(), "2024-01-31 23:59:58.123".len());
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok());
    }
}
