use std::path::PathBuf;

use thiserror::Error;

use crate::events::ErrorKind;
use crate::transport::TransportError;

/// Terminal outcome of a single failed transfer.
///
/// None of these are retried here; the orchestrator decides what a failure
/// means for the rest of the sync.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote returned no content for {url}")]
    ContentEmpty { url: String },

    #[error("temp file {} vanished before finalize", path.display())]
    TempFileMissing { path: PathBuf },

    #[error("temp file {} holds {actual} bytes, expected {expected}", path.display())]
    TempFileMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("body for {url} ended after {received} of {expected} bytes")]
    ShortBody {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::ContentEmpty { .. } => ErrorKind::ContentEmpty,
            TransferError::TempFileMissing { .. } | TransferError::TempFileMismatch { .. } => {
                ErrorKind::TempFileMissing
            }
            TransferError::ShortBody { .. } | TransferError::Transport(_) => ErrorKind::Transport,
            TransferError::Disk(_) => ErrorKind::Storage,
            TransferError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether another attempt could plausibly succeed. The calling layer
    /// uses this for its own retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport(e) => e.is_retryable(),
            TransferError::ShortBody { .. } => true,
            TransferError::TempFileMismatch { .. } => true,
            TransferError::ContentEmpty { .. }
            | TransferError::TempFileMissing { .. }
            | TransferError::Disk(_)
            | TransferError::Cancelled => false,
        }
    }
}
