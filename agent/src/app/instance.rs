//! Single-instance guard

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::errors::AgentError;

/// Exclusive lock held for the lifetime of the agent process. Two agents
/// on one host would race on the status file.
#[derive(Debug)]
pub struct SingleInstance {
    file: fs::File,
    path: PathBuf,
}

impl SingleInstance {
    /// Take the lock without blocking, failing if another agent holds it
    pub fn acquire(path: &Path) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| AgentError::AlreadyRunning(path.display().to_string()))?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!("Acquired instance lock {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingleInstance {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
