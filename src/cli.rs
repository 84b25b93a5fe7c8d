use clap::{Args, Parser, Subcommand};

use crate::types::{LogLevel, SplitPolicy};

#[derive(Parser, Debug)]
#[command(
    name = "bundlesync",
    about = "Incrementally mirror a versioned content store into a local cache"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Sync options when no subcommand is given
    #[command(flatten)]
    pub sync: SyncArgs,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

impl Cli {
    /// `sync` is the default command.
    pub fn effective_command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Sync(self.sync.clone()))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Bring the local cache up to the remote version (default)
    Sync(SyncArgs),
    /// Show the local version, any unfinished sync, and recent runs
    Status(StatusArgs),
    /// Diff two manifest files without touching the network
    Diff(DiffArgs),
    /// Delete the sync history and the pending download ledger
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct SyncArgs {
    /// Base URL of the remote store
    #[arg(long, env = "BUNDLESYNC_REMOTE_URL")]
    pub remote_url: Option<String>,

    #[command(flatten)]
    pub roots: RootArgs,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,

    /// Whole-sync retries on transient network errors
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,

    /// Base delay between retries in seconds (doubles each retry)
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// How an object name is derived from a `prefix_name` identifier
    #[arg(long, value_enum, default_value = "last")]
    pub identifier_split: SplitPolicy,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

/// Where local state lives. Shared by every command that reads it.
#[derive(Args, Debug, Clone, Default)]
pub struct RootArgs {
    /// Local content root; promoted versions live here
    #[arg(long, env = "BUNDLESYNC_LOCAL_ROOT")]
    pub local_root: Option<String>,

    /// Staging root for in-progress syncs (default: <local-root>/.download)
    #[arg(long)]
    pub download_root: Option<String>,

    /// Directory for the sync history database
    #[arg(long, default_value = "~/.bundlesync")]
    pub state_dir: String,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub roots: RootArgs,

    /// Number of recent runs to show
    #[arg(long, default_value_t = 5)]
    pub runs: usize,
}

#[derive(Args, Debug, Clone)]
pub struct DiffArgs {
    /// Local manifest (JSON array of identifiers); a missing file means no local manifest
    pub local: String,

    /// Remote manifest (JSON array of identifiers)
    pub remote: String,
}

#[derive(Args, Debug, Clone)]
pub struct ResetStateArgs {
    #[command(flatten)]
    pub roots: RootArgs,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}
