use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use super::error::ManifestError;
use super::{parse_names, Manifest};
use crate::download::paths::write_atomic;
use crate::sync::context::{SyncContext, HASH_TABLE};
use crate::transport::HttpClient;
use crate::types::Version;

/// Reads and writes the named lists that describe each version, locally
/// and on the remote.
#[derive(Debug, Clone, Copy)]
pub struct ManifestStore<'a> {
    ctx: &'a SyncContext,
}

impl<'a> ManifestStore<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// Current local version, or `None` if no version has been committed.
    pub async fn load_local_version(&self) -> Result<Option<Version>, ManifestError> {
        read_version_pointer(&self.ctx.local_version_pointer()).await
    }

    pub async fn store_local_version(&self, version: Version) -> Result<(), ManifestError> {
        let path = self.ctx.local_version_pointer();
        write_atomic(&path, version.to_string().as_bytes())
            .await
            .map_err(|e| ManifestError::io(path, e))
    }

    /// The hash table of a promoted local version. `None` when it is missing
    /// or unreadable, which callers must treat as "no diff information".
    pub async fn load_local_manifest(&self, version: Version) -> Option<Manifest> {
        let path = self.ctx.local_version_dir(version).join(HASH_TABLE);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                if e.kind() != IoErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "cannot read local manifest: {}", e);
                }
                return None;
            }
        };
        match Manifest::parse(&text) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(path = %path.display(), "local manifest is corrupt: {}", e);
                None
            }
        }
    }

    pub async fn fetch_remote_version(
        &self,
        client: &dyn HttpClient,
    ) -> Result<Version, ManifestError> {
        let url = self.ctx.remote_version_url();
        let text = client
            .get_text(url.as_str())
            .await
            .map_err(|source| ManifestError::Fetch {
                name: url.to_string(),
                source,
            })?;
        text.parse::<Version>()
            .map_err(|_| ManifestError::VersionParse { text })
    }

    /// Fetch the list `name` for `version`. Returns the raw text, so it can be
    /// persisted verbatim, together with the parsed names.
    pub async fn fetch_list(
        &self,
        client: &dyn HttpClient,
        version: Version,
        name: &str,
    ) -> Result<(String, Vec<String>), ManifestError> {
        let url = self.ctx.remote_url(version, name);
        let raw = client
            .get_text(url.as_str())
            .await
            .map_err(|source| ManifestError::Fetch {
                name: name.to_string(),
                source,
            })?;
        let names = parse_names(&raw).map_err(|source| ManifestError::Parse {
            name: name.to_string(),
            source,
        })?;
        Ok((raw, names))
    }

    /// Write a fetched list into the staging directory of `version`.
    pub async fn persist_list(
        &self,
        version: Version,
        name: &str,
        raw: &str,
    ) -> Result<PathBuf, ManifestError> {
        let path = self.ctx.staging_dir(version).join(name);
        write_atomic(&path, raw.as_bytes())
            .await
            .map_err(|e| ManifestError::io(&path, e))?;
        Ok(path)
    }

    /// Read back the staged hash table of `version`. Unlike the local side,
    /// failure here is an error.
    pub async fn load_staged_manifest(&self, version: Version) -> Result<Manifest, ManifestError> {
        let path = self.ctx.staging_dir(version).join(HASH_TABLE);
        let text = fs::read_to_string(&path)
            .await
            .map_err(|e| ManifestError::io(&path, e))?;
        Manifest::parse(&text).map_err(|source| ManifestError::Parse {
            name: HASH_TABLE.to_string(),
            source,
        })
    }
}

/// Read a version pointer file. A missing file is `None`, and so is one
/// that does not parse, with a warning.
pub async fn read_version_pointer(path: &Path) -> Result<Option<Version>, ManifestError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ManifestError::io(path, e)),
    };
    match text.parse::<Version>() {
        Ok(v) => Ok(Some(v)),
        Err(_) => {
            tracing::warn!(
                path = %path.display(),
                "local version pointer is unreadable, treating as absent"
            );
            Ok(None)
        }
    }
}
