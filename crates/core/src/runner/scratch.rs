//! Per-run scratch directories.

use std::io;
use std::path::{Path, PathBuf};

use super::RunnerError;

/// Prefix for scratch directory names under the configured root.
const SCRATCH_PREFIX: &str = "robotq-run-";

/// A uniquely named directory that holds one run's suite, variables and
/// output files.
///
/// Call [`ScratchDir::cleanup`] on every exit path. If the owning future is
/// dropped first, `Drop` removes the directory synchronously instead.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    removed: bool,
}

impl ScratchDir {
    /// Create a fresh directory under `root` (created if missing).
    pub async fn create(root: &Path) -> Result<Self, RunnerError> {
        let path = root.join(format!("{SCRATCH_PREFIX}{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| RunnerError::Scratch {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory. Errors are logged, never returned.
    pub async fn cleanup(mut self) {
        if let Err(e) = remove_dir_if_exists(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
        }
        self.removed = true;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory on drop");
            }
        }
    }
}

/// Recursively remove `path`. A directory that is already gone counts as
/// removed.
pub async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
