use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Suffix appended to a save path while its bytes are still arriving.
pub const TEMP_SUFFIX: &str = ".temp";

/// Temp path for a download: the save path with [`TEMP_SUFFIX`] appended,
/// so `cube` resumes from `cube.temp` in the same directory.
pub fn temp_download_path(save_path: &Path) -> PathBuf {
    let mut name = OsString::from(save_path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Final path component as a display string.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Replace `path` with `contents` so readers see either the old file or the
/// complete new one. Writes a sibling temp file, syncs it, then renames.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let staging = temp_download_path(path);
    let mut file = fs::File::create(&staging).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&staging, path).await
}
