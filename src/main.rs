//! bundlesync: incremental mirror of a versioned, content-addressed store.
//!
//! The remote publishes a version number, per-version manifests and
//! objects. Each sync diffs the remote manifest against the local one,
//! fetches only what is missing with resumable range requests, and
//! promotes the finished version into the local content root.

#![warn(clippy::all)]

mod cli;
mod config;
mod download;
mod events;
mod manifest;
pub mod retry;
mod shutdown;
mod state;
mod sync;
mod transport;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{Config, Roots};
use events::EventSink;
use manifest::Manifest;
use retry::RetryAction;
use state::{DownloadInfoLedger, StateDb};
use sync::SyncOrchestrator;

/// Run the sync command.
async fn run_sync(args: cli::SyncArgs) -> anyhow::Result<()> {
    let config = Config::from_sync_args(args)?;
    tracing::info!(
        remote = %config.remote_root,
        local_root = %config.roots.local_root.display(),
        "Starting bundlesync"
    );

    let client = transport::ReqwestClient::new(&config.transport)
        .context("Failed to build HTTP client")?;

    let history: Option<Arc<dyn StateDb>> = {
        let db_path = config.roots.db_path();
        let opened = match tokio::fs::create_dir_all(&config.roots.state_dir).await {
            Ok(()) => state::SqliteStateDb::open(&db_path)
                .await
                .map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        match opened {
            Ok(db) => {
                tracing::debug!("History database opened at {}", db_path.display());
                Some(Arc::new(db) as Arc<dyn StateDb>)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to open history database at {}: {}. Continuing without history.",
                    db_path.display(),
                    e
                );
                None
            }
        }
    };

    let orchestrator = SyncOrchestrator::new(config.sync_context(), Arc::new(client), history);
    tracing::debug!(
        download_root = %orchestrator.context().download_root.display(),
        split = ?orchestrator.context().split_policy,
        "Sync context ready"
    );
    let shutdown_token = shutdown::install_signal_handler();

    let (sink, rx) = EventSink::channel();
    let pb = download::create_progress_bar(config.no_progress_bar);
    let renderer = tokio::spawn(download::render_events(rx, pb));

    let started = Instant::now();
    let result = {
        let orchestrator = &orchestrator;
        let sink = &sink;
        let token = &shutdown_token;
        retry::retry_with_backoff(
            &config.retry,
            |e: &sync::SyncError| {
                if e.is_retryable() && !token.is_cancelled() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            move || orchestrator.sync(sink, token),
        )
        .await
    };
    drop(sink);
    let completed = renderer.await.unwrap_or_else(|e| {
        tracing::debug!("Progress renderer ended abnormally: {}", e);
        0
    });

    let elapsed = download::format_duration(started.elapsed());
    match result {
        Ok(report) if report.updated() => {
            tracing::info!(
                from = ?report.from_version.map(|v| v.0),
                to = %report.to_version,
                added = report.additions.len(),
                removed = report.removals.len(),
                transferred = report.transferred.len(),
                resumed = report.skipped.len(),
                objects = completed,
                "Updated to version {} in {}",
                report.to_version,
                elapsed
            );
            Ok(())
        }
        Ok(report) => {
            tracing::info!("Already at version {} ({})", report.to_version, elapsed);
            Ok(())
        }
        Err(e) => {
            tracing::debug!(state = %orchestrator.state(), "Sync ended");
            Err(anyhow::Error::new(e).context(format!("Sync failed after {}", elapsed)))
        }
    }
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let roots = Roots::from_args(&args.roots)?;
    println!("Content root: {}", roots.local_root.display());
    let pointer = roots.local_root.join(sync::context::LOCAL_VERSION_FILE);
    match manifest::store::read_version_pointer(&pointer).await? {
        Some(version) => println!("Local version: {}", version),
        None => println!("Local version: none"),
    }

    if let Some(pending) = DownloadInfoLedger::inspect(&roots.download_root.join(sync::context::LEDGER_FILE)).await? {
        println!(
            "Unfinished sync to version {}: {} item(s) already fetched",
            pending.version,
            pending.entries.len()
        );
    }
    println!();

    let db_path = roots.db_path();
    if !db_path.exists() {
        println!("No history database found at {}", db_path.display());
        println!("Run a sync first to create the database.");
        return Ok(());
    }

    let db = state::SqliteStateDb::open(&db_path).await?;
    let summary = db.get_summary().await?;

    println!("History Database: {}", db_path.display());
    println!();
    println!("Runs:");
    println!("  Total:  {}", summary.total_runs);
    println!("  Failed: {}", summary.failed_runs);
    if let Some(version) = summary.last_updated_version {
        println!("  Last version installed: {}", version);
    }
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    let runs = db.recent_runs(args.runs).await?;
    if !runs.is_empty() {
        println!();
        println!("Recent runs:");
        for run in runs {
            let target = run
                .to_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());
            let outcome = run
                .outcome
                .map(|o| o.as_str())
                .unwrap_or("unfinished");
            print!(
                "  #{} {} -> {} {} (+{} -{}, {} fetched, {} resumed)",
                run.id,
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                target,
                outcome,
                run.additions,
                run.removals,
                run.transferred,
                run.skipped
            );
            match run.error.as_deref() {
                Some(error) => println!(" - {}", error),
                None => println!(),
            }
        }
    }

    Ok(())
}

async fn read_manifest(path: &Path) -> anyhow::Result<Option<Manifest>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let manifest = Manifest::parse(&text)
        .with_context(|| format!("{} is not a JSON array of identifiers", path.display()))?;
    Ok(Some(manifest))
}

/// Run the diff command.
async fn run_diff(args: cli::DiffArgs) -> anyhow::Result<()> {
    let local_path = config::expand_tilde(&args.local);
    let remote_path = config::expand_tilde(&args.remote);

    let local = read_manifest(&local_path).await?;
    if local.is_none() {
        println!(
            "No manifest at {}, treating everything as new",
            local_path.display()
        );
    }
    let remote = read_manifest(&remote_path)
        .await?
        .with_context(|| format!("Remote manifest {} not found", remote_path.display()))?;

    if remote.is_empty() {
        println!("Remote manifest {} lists no identifiers", remote_path.display());
    }
    let diff = manifest::diff(local.as_ref(), &remote);
    for id in &diff.additions {
        println!("+ {}", id);
    }
    for id in &diff.removals {
        println!("- {}", id);
    }
    println!(
        "{} to fetch, {} stale",
        diff.additions.len(),
        diff.removals.len()
    );
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run the reset-state command.
async fn run_reset_state(args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let roots = Roots::from_args(&args.roots)?;
    let db_path = roots.db_path();
    let ledger_path = roots.download_root.join(sync::context::LEDGER_FILE);

    if !db_path.exists() && !ledger_path.exists() {
        println!("No sync state found");
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the sync history and the download ledger:");
        println!("  {}", db_path.display());
        println!("  {}", ledger_path.display());
        println!("The next sync restarts any unfinished version from scratch.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if remove_if_exists(&db_path)? {
        println!("History database deleted.");
    }
    // Also remove WAL and SHM files if they exist
    let _ = remove_if_exists(&db_path.with_extension("db-wal"));
    let _ = remove_if_exists(&db_path.with_extension("db-shm"));

    if remove_if_exists(&ledger_path)? {
        println!("Download ledger deleted.");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let filter = match cli.log_level {
        types::LogLevel::Debug => "debug",
        types::LogLevel::Info => "info",
        types::LogLevel::Warn => "warn",
        types::LogLevel::Error => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.effective_command() {
        Command::Sync(args) => run_sync(args).await,
        Command::Status(args) => run_status(args).await,
        Command::Diff(args) => run_diff(args).await,
        Command::ResetState(args) => run_reset_state(args).await,
    }
}
