//! Promotion of a finished staging directory into the local content root.

use std::ffi::OsString;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

/// Hard-link `from` to `to`, copying when linking is not possible
/// (different filesystem, or a filesystem without hard links).
pub(crate) async fn link_or_copy(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::hard_link(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok(()),
        Err(e) => {
            tracing::debug!(
                from = %from.display(),
                "hard link failed ({}), copying instead",
                e
            );
            fs::copy(from, to).await.map(|_| ())
        }
    }
}

/// Move `staging` to `target`.
///
/// A directory rename is tried first. If that fails (typically because the
/// two roots sit on different devices) the tree is copied instead; see
/// [`promote_by_copy`].
pub(crate) async fn promote(staging: &Path, target: &Path) -> std::io::Result<()> {
    if fs::try_exists(target).await? {
        tracing::warn!(
            target = %target.display(),
            "replacing leftover version directory"
        );
        fs::remove_dir_all(target).await?;
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(staging, target).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(
                staging = %staging.display(),
                target = %target.display(),
                "directory rename failed ({}), falling back to copy",
                e
            );
            promote_by_copy(staging, target).await
        }
    }
}

/// Copy `staging` to `<target>.partial`, rename that into place, then drop
/// `staging`.
///
/// A failed copy removes the partial tree and leaves `staging` untouched,
/// so nothing is lost and the caller can try again.
pub(crate) async fn promote_by_copy(staging: &Path, target: &Path) -> std::io::Result<()> {
    let partial = partial_path(target);
    if fs::try_exists(&partial).await? {
        fs::remove_dir_all(&partial).await?;
    }
    if let Err(e) = copy_dir(staging, &partial).await {
        if let Err(cleanup) = fs::remove_dir_all(&partial).await {
            if cleanup.kind() != IoErrorKind::NotFound {
                tracing::warn!(
                    partial = %partial.display(),
                    "could not remove partial copy: {}",
                    cleanup
                );
            }
        }
        return Err(e);
    }
    fs::rename(&partial, target).await?;
    if let Err(e) = fs::remove_dir_all(staging).await {
        tracing::warn!(
            staging = %staging.display(),
            "version promoted but staging directory could not be removed: {}",
            e
        );
    }
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

async fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dest = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), dest));
            } else {
                fs::copy(entry.path(), &dest).await?;
            }
        }
    }
    Ok(())
}
