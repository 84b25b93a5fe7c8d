use std::path::PathBuf;

use thiserror::Error;

use crate::download::TransferError;
use crate::events::ErrorKind;
use crate::manifest::ManifestError;
use crate::state::StateError;
use crate::types::Version;

/// Why a sync attempt ended in `Failed`.
///
/// Everything finished before the failure stays on disk and in the ledger,
/// so the next attempt resumes where this one stopped.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already running for {}", root.display())]
    Busy { root: PathBuf },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("transfer of {identifier} failed: {source}")]
    Transfer {
        identifier: String,
        #[source]
        source: TransferError,
    },

    #[error("failed to promote version {version}: {source}")]
    Finalize {
        version: Version,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Disk error at {}: {source}", path.display())]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub(crate) fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Manifest(e) => match e {
                ManifestError::Fetch { .. } => ErrorKind::ManifestFetch,
                ManifestError::Parse { .. } | ManifestError::InvalidName { .. } => {
                    ErrorKind::ManifestParse
                }
                ManifestError::VersionParse { .. } => ErrorKind::VersionParse,
                ManifestError::Io { .. } => ErrorKind::Storage,
            },
            Self::Transfer { source, .. } => source.kind(),
            Self::Finalize { .. } => ErrorKind::Finalize,
            Self::State(_) | Self::Disk { .. } => ErrorKind::Storage,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a later attempt could plausibly get further. Only network
    /// trouble qualifies.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Manifest(ManifestError::Fetch { source, .. }) => source.is_retryable(),
            Self::Transfer { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Transfer failures were already put on the event channel by the
    /// transfer itself.
    pub(crate) fn already_reported(&self) -> bool {
        matches!(self, Self::Transfer { .. })
    }
}
