//! Shared logging setup for soot binaries.
//!
//! Installs a `tracing` subscriber with two layers: a file layer writing to
//! `<soot home>/logs/<app>.log` and a stderr layer. The returned
//! [`LogHandle`] reopens the log file on demand, which is what the
//! reopen-logs signal (SIGUSR1) is wired to — external rotation tools move
//! the file aside and signal the process.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "soot=info,soot_arbiter=info,soot_worker=info,soot_client=info";

/// Logging configuration for a soot binary.
pub struct LogConfig<'a> {
    /// Base name of the log file, normally the binary or role name.
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warnings only.
    pub verbose: bool,
}

/// Handle to the active file writer. Cheap to clone; `reopen` affects all
/// clones.
#[derive(Clone)]
pub struct LogHandle {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl LogHandle {
    fn open(path: PathBuf) -> Result<Self> {
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Close and reopen the log file at its original path.
    pub fn reopen(&self) -> Result<()> {
        let reopened = open_append(&self.path)?;
        let mut guard = self.file.lock().expect("log writer lock poisoned");
        *guard = Some(reopened);
        Ok(())
    }

    /// Path of the log file this handle writes to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn open_append(path: &std::path::Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

pub struct HandleWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for HandleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        match guard.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        match guard.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogHandle {
    type Writer = HandleWriter;

    fn make_writer(&'a self) -> Self::Writer {
        HandleWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Initialize tracing with a file layer and a stderr layer.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogHandle> {
    let log_dir = ensure_logs_dir()?;
    let handle = LogHandle::open(log_dir.join(format!("{}.log", sanitize_name(config.app_name))))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(handle.clone())
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(handle)
}

/// The soot home directory: `$SOOT_HOME` or `~/.soot`.
pub fn soot_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("SOOT_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("could not determine home directory")
        .join(".soot")
}

/// The logs directory, created on demand.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = soot_home().join("logs");
    fs::create_dir_all(&logs)
        .with_context(|| format!("failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_name("soot/arbiter 1"), "soot_arbiter_1");
        assert_eq!(sanitize_name("worker-3"), "worker-3");
    }

    #[test]
    fn reopen_switches_to_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let handle = LogHandle::open(path.clone()).unwrap();

        use tracing_subscriber::fmt::MakeWriter;
        handle.make_writer().write_all(b"before\n").unwrap();

        // Simulate external rotation: move the file aside, then reopen.
        let rotated = dir.path().join("test.log.1");
        fs::rename(&path, &rotated).unwrap();
        handle.reopen().unwrap();
        handle.make_writer().write_all(b"after\n").unwrap();

        let mut rotated_content = String::new();
        File::open(&rotated)
            .unwrap()
            .read_to_string(&mut rotated_content)
            .unwrap();
        assert_eq!(rotated_content, "before\n");

        let mut fresh_content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut fresh_content)
            .unwrap();
        assert_eq!(fresh_content, "after\n");
    }
}
