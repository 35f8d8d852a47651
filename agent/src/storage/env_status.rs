//! Durable status store
//!
//! The status of every tracked environment lives in one JSON file keyed by
//! environment name. Each read or write holds an exclusive advisory lock on
//! the sibling `<file>.lock`, and writes replace the whole file atomically.

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::models::deploy_status::Envs;
use crate::storage::settings::HostTypeSentinelSettings;

/// Lock held for the duration of one load or dump
struct StatusLock {
    file: fs::File,
}

impl StatusLock {
    fn acquire(path: &Path) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()
            .map_err(|e| AgentError::LockError(format!("{}: {}", path.display(), e)))?;
        Ok(Self { file })
    }
}

impl Drop for StatusLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Lock-guarded store of the tracked environments
#[derive(Debug, Clone)]
pub struct EnvStatus {
    file: File,
    lock_path: PathBuf,
    sentinel: Option<HostTypeSentinelSettings>,
}

impl EnvStatus {
    pub fn new(status_file: File) -> Self {
        let lock_path = status_file.sibling("lock");
        Self {
            file: status_file,
            lock_path,
            sentinel: None,
        }
    }

    pub fn with_sentinel(mut self, sentinel: Option<HostTypeSentinelSettings>) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Load all tracked environments.
    ///
    /// A missing file is a first run and yields an empty map. A file that
    /// cannot be parsed yields `CorruptState` so the caller decides what to
    /// do with it.
    pub async fn load_envs(&self) -> Result<Envs, AgentError> {
        let _lock = StatusLock::acquire(&self.lock_path)?;

        if !self.file.exists().await {
            info!(
                "No status file at {}, first run or nothing deployed yet",
                self.file.path().display()
            );
            return Ok(Envs::new());
        }

        let contents = self.file.read_string().await?;
        let envs: Envs = serde_json::from_str(&contents).map_err(|e| {
            AgentError::CorruptState(format!("{}: {}", self.file.path().display(), e))
        })?;
        debug!("Loaded {} environments from status file", envs.len());
        Ok(envs)
    }

    /// Persist all tracked environments, returning false on failure
    pub async fn dump_envs(&self, envs: &Envs) -> bool {
        match self.write_envs(envs).await {
            Ok(()) => {
                if let Some(sentinel) = self.sentinel.as_ref() {
                    update_sentinel(sentinel, envs).await;
                }
                true
            }
            Err(e) => {
                warn!(
                    "Could not write status file {}: {}",
                    self.file.path().display(),
                    e
                );
                false
            }
        }
    }

    async fn write_envs(&self, envs: &Envs) -> Result<(), AgentError> {
        let json = serde_json::to_vec_pretty(envs)?;
        let _lock = StatusLock::acquire(&self.lock_path)?;
        self.file.write_atomic(&json).await
    }

    /// Move an unreadable status file out of the way
    pub async fn quarantine(&self) -> Result<PathBuf, AgentError> {
        let _lock = StatusLock::acquire(&self.lock_path)?;
        self.file.move_aside("corrupt").await
    }
}

async fn update_sentinel(sentinel: &HostTypeSentinelSettings, envs: &Envs) {
    let file = File::new(sentinel.dir.join(&sentinel.host_type));
    let matched = envs
        .values()
        .any(|status| status.report.stage_name == sentinel.host_type);

    let result = if matched {
        debug!("Host is a {}", sentinel.host_type);
        file.touch().await
    } else {
        file.delete().await
    };
    if let Err(e) = result {
        warn!(
            "Could not update host type file {}: {}",
            file.path().display(),
            e
        );
    }
}
