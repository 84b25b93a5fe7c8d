//! The DownloadInfo ledger: which identifiers of the current sync session
//! are already complete on disk.
//!
//! The whole set is rewritten atomically after every mutation. Transfers
//! are sequential, so there is never more than one writer.

use std::collections::BTreeSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::error::StateError;
use crate::download::paths::{temp_download_path, write_atomic};
use crate::types::Version;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: Version,
    #[serde(rename = "DownloadFileNames")]
    download_file_names: BTreeSet<String>,
}

/// Read-only view of a ledger on disk, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub version: Version,
    pub entries: Vec<String>,
}

#[derive(Debug)]
pub struct DownloadInfoLedger {
    path: PathBuf,
    version: Version,
    completed: BTreeSet<String>,
}

impl DownloadInfoLedger {
    /// Load the ledger for a session targeting `version`.
    ///
    /// A missing file, a corrupt file, or a ledger left by a session that
    /// targeted another version all start an empty session.
    pub async fn load(path: impl Into<PathBuf>, version: Version) -> Result<Self, StateError> {
        let path = path.into();
        let completed = match read_file(&path).await? {
            Some(file) if file.version == version => file.download_file_names,
            Some(file) => {
                tracing::info!(
                    stale = %file.version,
                    target = %version,
                    "discarding ledger from a different sync session"
                );
                BTreeSet::new()
            }
            None => BTreeSet::new(),
        };
        Ok(Self {
            path,
            version,
            completed,
        })
    }

    /// Inspect a ledger without binding it to a session.
    pub async fn inspect(path: &Path) -> Result<Option<LedgerSnapshot>, StateError> {
        Ok(read_file(path).await?.map(|file| LedgerSnapshot {
            version: file.version,
            entries: file.download_file_names.into_iter().collect(),
        }))
    }

    #[cfg(test)]
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.completed.contains(identifier)
    }

    #[cfg(test)]
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.completed.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Record `identifier` as complete and persist. Returns false if it was
    /// already recorded.
    pub async fn record(&mut self, identifier: &str) -> Result<bool, StateError> {
        if !self.completed.insert(identifier.to_string()) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    /// Drop every entry whose artifact is missing or still has a temp file
    /// next to it, so that object gets transferred again. Returns the
    /// dropped identifiers.
    pub async fn reconcile<F>(&mut self, artifact_path: F) -> Result<Vec<String>, StateError>
    where
        F: Fn(&str) -> PathBuf,
    {
        let mut stale = Vec::new();
        for identifier in &self.completed {
            let path = artifact_path(identifier);
            let present = fs::try_exists(&path).await.unwrap_or(false);
            let partial = fs::try_exists(temp_download_path(&path))
                .await
                .unwrap_or(false);
            if !present || partial {
                tracing::warn!(
                    identifier = %identifier,
                    path = %path.display(),
                    "ledger entry has no finished artifact, will transfer again"
                );
                stale.push(identifier.clone());
            }
        }
        if !stale.is_empty() {
            for identifier in &stale {
                self.completed.remove(identifier);
            }
            self.persist().await?;
        }
        Ok(stale)
    }

    /// End the session: remove the ledger file.
    pub async fn clear(self) -> Result<(), StateError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::ledger(&self.path, e)),
        }
    }

    async fn persist(&self) -> Result<(), StateError> {
        let file = LedgerFile {
            version: self.version,
            download_file_names: self.completed.clone(),
        };
        let json = serde_json::to_vec(&file)
            .map_err(|e| StateError::ledger(&self.path, std::io::Error::other(e)))?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| StateError::ledger(&self.path, e))
    }
}

async fn read_file(path: &Path) -> Result<Option<LedgerFile>, StateError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::ledger(path, e)),
    };
    match serde_json::from_slice::<LedgerFile>(&bytes) {
        Ok(file) => Ok(Some(file)),
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring corrupt ledger: {}", e);
            Ok(None)
        }
    }
}
