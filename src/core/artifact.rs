use std::{
    io,
    path::{Path, PathBuf},
};

use rand::{Rng, distributions::Alphanumeric};
use tokio::{fs, io::AsyncReadExt};

use crate::{
    constants::{OMIT_STRING_LEN, TOKEN_LEN},
    core::{domain::OmitString, layout::WorkUser},
};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("{path} is not a regular file")]
    NotRegular { path: PathBuf },
    #[error("cannot {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArtifactError {
    fn io(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| ArtifactError::Io { op, path, source }
    }
}

/// Random `[a-zA-Z0-9]` token of `len` characters.
pub fn gen_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Creates a random-named directory under `parent`, returning its name and full path.
pub async fn make_scratch_dir(
    parent: &Path,
    owner: Option<WorkUser>,
) -> Result<(String, PathBuf), ArtifactError> {
    let name = gen_token(TOKEN_LEN);
    let path = parent.join(&name);

    fs::DirBuilder::new()
        .mode(0o755)
        .create(&path)
        .await
        .map_err(ArtifactError::io("create directory", &path))?;

    if let Some(owner) = owner {
        std::os::unix::fs::chown(&path, Some(owner.uid), Some(owner.gid))
            .map_err(ArtifactError::io("chown", &path))?;
    }

    Ok((name, path))
}

/// Reads at most [`OMIT_STRING_LEN`] bytes of a file; `None` when the file is empty.
pub async fn read_bounded(path: &Path) -> Result<Option<OmitString>, ArtifactError> {
    read_bounded_with_cap(path, OMIT_STRING_LEN).await
}

pub async fn read_bounded_with_cap(
    path: &Path,
    cap: u64,
) -> Result<Option<OmitString>, ArtifactError> {
    let mut file = fs::File::open(path)
        .await
        .map_err(ArtifactError::io("open", path))?;
    let total = file
        .metadata()
        .await
        .map_err(ArtifactError::io("stat", path))?
        .len();
    if total == 0 {
        return Ok(None);
    }

    let read_size = total.min(cap);
    let mut buf = vec![0u8; read_size as usize];
    file.read_exact(&mut buf)
        .await
        .map_err(ArtifactError::io("read", path))?;

    Ok(Some(OmitString {
        text: String::from_utf8_lossy(&buf).into_owned(),
        omitted: total - read_size,
    }))
}

/// Replaces `dst` with a copy of the regular file `src`.
///
/// `dst` is left untouched when `src` is missing or not a regular file.
/// Permission bits are carried over, so a copied checker stays executable.
pub async fn safe_copy(src: &Path, dst: &Path) -> Result<(), ArtifactError> {
    let meta = fs::metadata(src)
        .await
        .map_err(ArtifactError::io("stat", src))?;
    if !meta.is_file() {
        return Err(ArtifactError::NotRegular {
            path: src.to_path_buf(),
        });
    }

    match fs::remove_file(dst).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            return Err(ArtifactError::io("remove", dst)(e));
        }
        _ => {}
    }

    fs::copy(src, dst)
        .await
        .map_err(ArtifactError::io("copy to", dst))?;
    Ok(())
}

/// Creates a random-named file in `dir`, opened for writing.
pub async fn create_temp_file(dir: &Path) -> Result<(PathBuf, std::fs::File), ArtifactError> {
    let path = dir.join(gen_token(TOKEN_LEN));
    let file = fs::File::create(&path)
        .await
        .map_err(ArtifactError::io("create temp file", &path))?;
    Ok((path, file.into_std().await))
}

pub async fn open_input(path: &Path) -> Result<std::fs::File, ArtifactError> {
    let file = fs::File::open(path)
        .await
        .map_err(ArtifactError::io("open input file", path))?;
    Ok(file.into_std().await)
}

/// Removes a temp file; failures are only logged.
pub async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove temp file {}: {}", path.display(), e);
        }
    }
}
