use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;

use super::error::TransferError;
use super::paths;
use crate::events::{EventSink, SyncEvent};
use crate::transport::{BodyStream, HttpClient};

/// Byte accounting for one in-flight transfer.
#[derive(Debug, Clone, Copy, Default)]
struct TransferState {
    /// Bytes already in the temp file when the request was issued.
    resume_offset: u64,
    /// Remaining length announced by the server, if any.
    remaining: Option<u64>,
    /// Bytes written during this session.
    received: u64,
}

impl TransferState {
    fn on_disk(&self) -> u64 {
        self.resume_offset + self.received
    }

    fn total(&self) -> u64 {
        self.remaining
            .map(|r| r + self.resume_offset)
            .unwrap_or(0)
    }
}

/// Successful completion of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub file_name: String,
    pub message: String,
    pub resumed_from: u64,
    pub size: u64,
}

/// Fetches one remote object into `save_path` through `<save_path>.temp`.
///
/// Whatever is already in the temp file is kept and the request asks only
/// for the bytes after it. The save path is only ever replaced by a rename
/// of a complete temp file; failures and cancellation leave the temp file
/// as far as it was written so the next attempt can resume.
#[derive(Debug, Clone)]
pub struct ResumableTransfer {
    url: String,
    save_path: PathBuf,
    temp_path: PathBuf,
    label: String,
}

impl ResumableTransfer {
    pub fn new(url: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        let save_path = save_path.into();
        let temp_path = paths::temp_download_path(&save_path);
        let label = paths::display_name(&save_path);
        Self {
            url: url.into(),
            save_path,
            temp_path,
            label,
        }
    }

    #[cfg(test)]
    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Run the transfer, emitting progress and exactly one terminal event.
    pub async fn run(
        &self,
        client: &dyn HttpClient,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let result = self.attempt(client, events, cancel).await;
        match &result {
            Ok(outcome) => {
                tracing::debug!(
                    path = %self.save_path.display(),
                    size = outcome.size,
                    resumed_from = outcome.resumed_from,
                    "transfer complete"
                );
                events.emit(SyncEvent::Completed {
                    object: outcome.file_name.clone(),
                    message: outcome.message.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(url = %self.url, "transfer failed: {}", e);
                events.emit(SyncEvent::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn attempt(
        &self,
        client: &dyn HttpClient,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut state = TransferState {
            resume_offset: existing_len(&self.temp_path).await?,
            ..TransferState::default()
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = client.get_from(&self.url, state.resume_offset) => response?,
        };

        if response.status == 416 || response.content_length == Some(0) {
            return Err(TransferError::ContentEmpty {
                url: self.url.clone(),
            });
        }
        state.remaining = response.content_length;

        if let Some(parent) = self.save_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.temp_path)
            .await?;

        let on_open = file.metadata().await?.len();
        if on_open != state.resume_offset {
            drop(file);
            return Err(TransferError::TempFileMismatch {
                path: self.temp_path.clone(),
                expected: state.resume_offset,
                actual: on_open,
            });
        }

        if response.status == 200 && state.resume_offset > 0 {
            tracing::warn!(
                url = %self.url,
                offset = state.resume_offset,
                "server ignored range request, restarting from byte 0"
            );
            file.set_len(0).await?;
            state.resume_offset = 0;
        }
        file.seek(SeekFrom::Start(state.resume_offset)).await?;

        let streamed = self
            .stream_body(&mut file, response.body, &mut state, events, cancel)
            .await;
        // Close the handle before touching either path. Flush first so every
        // acknowledged chunk stays on disk as resume material.
        let flushed = file.flush().await;
        drop(file);
        streamed?;
        flushed?;

        if let Some(remaining) = state.remaining {
            if state.received < remaining {
                return Err(TransferError::ShortBody {
                    url: self.url.clone(),
                    expected: remaining,
                    received: state.received,
                });
            }
        }

        self.finalize(&state).await
    }

    async fn stream_body(
        &self,
        file: &mut File,
        mut body: BodyStream,
        state: &mut TransferState,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                return Ok(());
            };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            file.write_all(&chunk).await?;
            state.received += chunk.len() as u64;
            events.progress(&self.label, state.on_disk(), state.total());
        }
    }

    async fn finalize(&self, state: &TransferState) -> Result<TransferOutcome, TransferError> {
        let actual = match fs::metadata(&self.temp_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(TransferError::TempFileMissing {
                    path: self.temp_path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if actual != state.on_disk() {
            // No longer trustworthy as resume material.
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(TransferError::TempFileMismatch {
                path: self.temp_path.clone(),
                expected: state.on_disk(),
                actual,
            });
        }

        if fs::try_exists(&self.save_path).await? {
            fs::remove_file(&self.save_path).await?;
        }
        fs::rename(&self.temp_path, &self.save_path).await?;

        let message = if state.resume_offset > 0 {
            format!(
                "downloaded {} bytes (resumed at byte {})",
                actual, state.resume_offset
            )
        } else {
            format!("downloaded {} bytes", actual)
        };
        Ok(TransferOutcome {
            file_name: paths::display_name(&self.save_path),
            message,
            resumed_from: state.resume_offset,
            size: actual,
        })
    }
}

async fn existing_len(path: &Path) -> std::io::Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}
