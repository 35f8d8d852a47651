//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the agent directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all agent state
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base(&self) -> Dir {
        Dir::new(&self.base_dir)
    }

    /// Persisted deploy status of every tracked environment
    pub fn env_status_file(&self) -> File {
        File::new(self.base_dir.join("env_status"))
    }

    /// Host identity file, `key=value` per line
    pub fn host_info_file(&self) -> File {
        File::new(self.base_dir.join("host_info"))
    }

    /// Script variables of one environment, consumed by template substitution
    pub fn script_config_file(&self, env_name: &str) -> File {
        File::new(self.base_dir.join(format!("{}_SCRIPT_CONFIG", env_name)))
    }

    /// Lock file guarding against a second agent on the host
    pub fn instance_lock_file(&self) -> File {
        File::new(self.base_dir.join("deployd.pid"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::AgentError> {
        self.base().create().await
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/tmp/deployd")
    }
}
