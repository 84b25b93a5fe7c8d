//! Persistent state.
//!
//! Two stores live here:
//! - the DownloadInfo ledger, a small JSON file that makes a multi-object
//!   sync resumable after a restart
//! - an SQLite history of sync runs, used for status reporting

pub mod db;
pub mod error;
pub mod ledger;
pub mod schema;
pub mod types;

pub use db::{SqliteStateDb, StateDb};
pub use error::StateError;
pub use ledger::DownloadInfoLedger;
pub use types::{SyncOutcome, SyncRunStats};
