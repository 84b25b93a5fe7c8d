//! Error types for the state tracking module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the history database and the download ledger.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// Reading or writing the ledger file failed.
    #[error("Ledger I/O failed at {path}: {source}")]
    Ledger {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    pub(crate) fn ledger(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Ledger {
            path: path.into(),
            source,
        }
    }
}
