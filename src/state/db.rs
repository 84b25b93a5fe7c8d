//! History database trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{SyncOutcome, SyncRunRecord, SyncRunStats, SyncSummary};
use crate::types::Version;

/// Trait for sync history operations.
///
/// Object-safe, so the orchestrator can hold an `Arc<dyn StateDb>`.
#[async_trait]
pub trait StateDb: Send + Sync {
    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self, from_version: Option<Version>) -> Result<i64, StateError>;

    /// Complete a sync run with statistics.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError>;

    /// Most recent runs, newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StateError>;

    /// Get a summary of the history.
    async fn get_summary(&self) -> Result<SyncSummary, StateError>;
}

/// SQLite implementation of the history database.
pub struct SqliteStateDb {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateDb {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Get the path to the database file.
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateDb for SqliteStateDb {
    async fn start_sync_run(&self, from_version: Option<Version>) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let from_version = from_version.map(version_to_sql);

        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        conn.execute(
            "INSERT INTO sync_runs (started_at, from_version) VALUES (?1, ?2)",
            rusqlite::params![started_at, from_version],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();

        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, to_version = ?2, additions = ?3, removals = ?4, transferred = ?5, skipped = ?6, outcome = ?7, last_error = ?8 WHERE id = ?9",
            rusqlite::params![
                completed_at,
                stats.to_version.map(version_to_sql),
                stats.additions as i64,
                stats.removals as i64,
                stats.transferred as i64,
                stats.skipped as i64,
                stats.outcome.as_str(),
                stats.error,
                run_id
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StateError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, started_at, completed_at, from_version, to_version, additions, removals, transferred, skipped, outcome, last_error FROM sync_runs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([limit as i64], row_to_run_record)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records)
    }

    async fn get_summary(&self) -> Result<SyncSummary, StateError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))?;

        let total_runs: u64 = conn
            .query_row("SELECT COUNT(*) FROM sync_runs", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(StateError::query)? as u64;

        let failed_runs: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_runs WHERE outcome = 'failed'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(StateError::query)? as u64;

        let last_updated_version: Option<i64> = conn
            .query_row(
                "SELECT to_version FROM sync_runs WHERE outcome = 'updated' ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(StateError::query)?
            .flatten();

        let last_sync: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let (last_sync_started, last_sync_completed) = match last_sync {
            Some((started, completed)) => (
                started.and_then(timestamp),
                completed.and_then(timestamp),
            ),
            None => (None, None),
        };

        Ok(SyncSummary {
            total_runs,
            failed_runs,
            last_updated_version: last_updated_version.map(version_from_sql),
            last_sync_completed,
            last_sync_started,
        })
    }
}

/// SQLite integers are signed; versions beyond i64::MAX are clamped.
fn version_to_sql(v: Version) -> i64 {
    i64::try_from(v.0).unwrap_or(i64::MAX)
}

fn version_from_sql(v: i64) -> Version {
    Version(v.max(0) as u64)
}

fn timestamp(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

fn row_to_run_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRunRecord> {
    let started_at: i64 = row.get(1)?;
    let completed_at: Option<i64> = row.get(2)?;
    let from_version: Option<i64> = row.get(3)?;
    let to_version: Option<i64> = row.get(4)?;
    let outcome: Option<String> = row.get(9)?;
    Ok(SyncRunRecord {
        id: row.get(0)?,
        started_at: timestamp(started_at).unwrap_or_default(),
        completed_at: completed_at.and_then(timestamp),
        from_version: from_version.map(version_from_sql),
        to_version: to_version.map(version_from_sql),
        additions: row.get::<_, i64>(5)?.max(0) as u64,
        removals: row.get::<_, i64>(6)?.max(0) as u64,
        transferred: row.get::<_, i64>(7)?.max(0) as u64,
        skipped: row.get::<_, i64>(8)?.max(0) as u64,
        outcome: outcome.as_deref().and_then(SyncOutcome::from_str),
        error: row.get(10)?,
    })
}
