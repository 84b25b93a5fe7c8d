//! Notification channel between the sync core and whatever renders it.
//!
//! Each transfer emits zero or more [`SyncEvent::Progress`] followed by
//! exactly one [`SyncEvent::Completed`] or [`SyncEvent::Failed`]. The
//! orchestrator adds [`SyncEvent::State`] on every transition. Dropping the
//! receiver stops delivery; the sync itself keeps going.

use std::fmt;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::sync::SyncState;

/// Error categories surfaced on the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    ContentEmpty,
    TempFileMissing,
    ManifestParse,
    ManifestFetch,
    VersionParse,
    Finalize,
    Storage,
    Cancelled,
    Busy,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::ContentEmpty => "content_empty",
            Self::TempFileMissing => "temp_file_missing",
            Self::ManifestParse => "manifest_parse",
            Self::ManifestFetch => "manifest_fetch",
            Self::VersionParse => "version_parse",
            Self::Finalize => "finalize",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    State(SyncState),
    Progress {
        object: String,
        /// `received / total`, clamped to `0.0..=1.0`; `0.0` while the total is unknown.
        fraction: f32,
        received: u64,
        total: u64,
    },
    Completed {
        object: String,
        message: String,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

/// Cloneable sending half. A sink built with [`EventSink::disabled`]
/// swallows everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<SyncEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(event);
        }
    }

    pub fn progress(&self, object: &str, received: u64, total: u64) {
        let fraction = if total > 0 {
            (received as f64 / total as f64).clamp(0.0, 1.0) as f32
        } else {
            0.0
        };
        self.emit(SyncEvent::Progress {
            object: object.to_string(),
            fraction,
            received,
            total,
        });
    }
}
