use std::path::{Path, PathBuf};

/// Unprivileged identity sandboxed processes run as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct WorkUser {
    pub uid: u32,
    pub gid: u32,
}

/// Where scratch trees and temp files live, seen from the host and from inside the sandbox.
#[derive(Clone, Debug)]
pub struct Layout {
    /// Host directory the sandbox uses as its root filesystem.
    pub rootfs: PathBuf,
    /// Absolute path of the scratch parent as seen inside the sandbox.
    pub work_dir: PathBuf,
    /// Host-only directory for per-test temporary files.
    pub cache_dir: PathBuf,
    pub work_user: Option<WorkUser>,
}

impl Layout {
    pub fn work_dir_global(&self) -> PathBuf {
        self.rootfs.join(strip_root(&self.work_dir))
    }

    /// Host path of a scratch entry given relative to the work dir.
    pub fn global(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.work_dir_global().join(relative)
    }

    /// In-sandbox path of a scratch entry given relative to the work dir.
    pub fn in_rootfs(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(relative)
    }
}

pub fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}
