use std::path::{Path, PathBuf};

use tokio::fs;

use crate::core::{
    artifact::{ArtifactError, make_scratch_dir},
    layout::Layout,
};

/// Per-request parent of every scratch directory. Removed exactly once,
/// by [`ScratchRoot::remove`] or on drop when a request is abandoned.
#[derive(Debug)]
pub struct ScratchRoot {
    name: String,
    path: Option<PathBuf>,
}

impl ScratchRoot {
    pub async fn create(layout: &Layout) -> Result<Self, ArtifactError> {
        let (name, path) = make_scratch_dir(&layout.work_dir_global(), layout.work_user).await?;
        tracing::debug!("Created scratch root {}", path.display());
        Ok(ScratchRoot {
            name,
            path: Some(path),
        })
    }

    /// Name relative to the work dir.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    pub async fn remove(mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_dir_all(&path).await {
                tracing::error!("Failed to remove scratch root {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for ScratchRoot {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            tracing::warn!("Scratch root {} dropped without cleanup", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                tracing::error!("Failed to remove scratch root {}: {}", path.display(), e);
            }
        }
    }
}
