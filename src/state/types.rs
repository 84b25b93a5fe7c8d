//! Types for the sync history.

use chrono::{DateTime, Utc};

use crate::types::Version;

/// How a sync run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local and remote versions already matched.
    UpToDate,
    /// A new version was promoted.
    Updated,
    Failed,
    /// Stopped by shutdown before reaching a terminal state.
    Cancelled,
}

impl SyncOutcome {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "up_to_date",
            Self::Updated => "updated",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "up_to_date" => Some(Self::UpToDate),
            "updated" => Some(Self::Updated),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::UpToDate | Self::Updated)
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics recorded when a sync run completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunStats {
    /// Remote version the run targeted, if it got far enough to learn it.
    pub to_version: Option<Version>,
    pub additions: u64,
    pub removals: u64,
    /// Objects fetched over the network in this run.
    pub transferred: u64,
    /// Objects skipped because an earlier run already finished them.
    pub skipped: u64,
    pub outcome: SyncOutcome,
    pub error: Option<String>,
}

impl SyncRunStats {
    pub fn new(outcome: SyncOutcome) -> Self {
        Self {
            to_version: None,
            additions: 0,
            removals: 0,
            transferred: 0,
            skipped: 0,
            outcome,
            error: None,
        }
    }
}

/// A row of the sync history.
#[derive(Debug, Clone)]
pub struct SyncRunRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    /// `None` if the process died mid-run.
    pub completed_at: Option<DateTime<Utc>>,
    pub from_version: Option<Version>,
    pub to_version: Option<Version>,
    pub additions: u64,
    pub removals: u64,
    pub transferred: u64,
    pub skipped: u64,
    pub outcome: Option<SyncOutcome>,
    pub error: Option<String>,
}

/// Summary of the sync history.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    /// Total number of runs recorded.
    pub total_runs: u64,
    /// Number of runs that ended in failure.
    pub failed_runs: u64,
    /// Version promoted by the most recent successful update.
    pub last_updated_version: Option<Version>,
    /// Time of the last completed sync run (if any).
    pub last_sync_completed: Option<DateTime<Utc>>,
    /// Time of the last sync run start (if any).
    pub last_sync_started: Option<DateTime<Utc>>,
}
