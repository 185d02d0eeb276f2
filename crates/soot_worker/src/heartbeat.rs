//! Worker liveness via a shared heartbeat file.
//!
//! The worker bumps the file's mtime; the arbiter reads the mtime and treats
//! a gap beyond the request timeout as a stuck worker.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug)]
pub struct Heartbeat {
    path: PathBuf,
    file: File,
}

impl Heartbeat {
    /// Create (or truncate) the heartbeat file and record an initial beat.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let beat = Self {
            path: path.to_path_buf(),
            file,
        };
        beat.touch();
        Ok(beat)
    }

    /// Record a beat. Failures are logged, never fatal: a worker that can
    /// no longer touch its heartbeat will be culled by the arbiter anyway.
    pub fn touch(&self) {
        if let Err(err) = self.file.set_modified(SystemTime::now()) {
            tracing::debug!(path = %self.path.display(), %err, "heartbeat touch failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arbiter side: seconds since the last beat.
    pub fn age_of(path: &Path) -> io::Result<f64> {
        let mtime = std::fs::metadata(path)?.modified()?;
        Ok(SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default()
            .as_secs_f64())
    }
}
