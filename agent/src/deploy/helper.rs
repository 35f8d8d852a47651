//! Build garbage collection helpers

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::filesys::dir::Dir;

/// Inspection and removal of builds on local disk
#[async_trait]
pub trait BuildHelper: Send + Sync {
    /// `(build, mtime)` of every build directory installed under `builds_dir`
    async fn builds_available_locally(&self, builds_dir: &Path) -> Vec<(String, SystemTime)>;

    /// Builds beyond the newest `keep`, oldest first
    fn get_stale_builds(&self, builds: Vec<(String, SystemTime)>, keep: usize) -> Vec<String> {
        stale_builds(builds, keep)
    }

    /// Remove a build with its pointer files and archive
    async fn clean_package(&self, builds_dir: &Path, build: &str, build_name: &str);
}

pub fn stale_builds(mut builds: Vec<(String, SystemTime)>, keep: usize) -> Vec<String> {
    builds.sort_by_key(|(_, mtime)| *mtime);
    let stale = builds.len().saturating_sub(keep);
    builds.into_iter().take(stale).map(|(build, _)| build).collect()
}

#[derive(Debug, Clone, Default)]
pub struct LocalBuildHelper;

#[async_trait]
impl BuildHelper for LocalBuildHelper {
    async fn builds_available_locally(&self, builds_dir: &Path) -> Vec<(String, SystemTime)> {
        match Dir::new(builds_dir).list_dirs_with_mtime().await {
            Ok(builds) => builds,
            Err(e) => {
                // no builds directory, nothing installed yet
                debug!("Cannot list builds in {}: {}", builds_dir.display(), e);
                Vec::new()
            }
        }
    }

    async fn clean_package(&self, builds_dir: &Path, build: &str, build_name: &str) {
        let dir = Dir::new(builds_dir);

        for pointer in ["extracted", "staged"] {
            let file = dir.file(&format!("{}.{}", build, pointer));
            if let Err(e) = file.delete().await {
                warn!("Failed to remove {}: {}", file.path().display(), e);
            }
        }

        let build_dir = dir.subdir(build);
        if let Err(e) = build_dir.delete().await {
            warn!("Failed to remove build directory {}: {}", build_dir.path().display(), e);
        }

        let archive_prefix = format!("{}-{}.", build_name, build);
        match dir.files_with_prefix(&archive_prefix).await {
            Ok(archives) => {
                if let Some(archive) = archives.first() {
                    if let Err(e) = archive.delete().await {
                        warn!("Failed to remove archive {}: {}", archive.path().display(), e);
                    }
                }
            }
            Err(e) => warn!("Failed to list archives in {}: {}", builds_dir.display(), e),
        }
    }
}
