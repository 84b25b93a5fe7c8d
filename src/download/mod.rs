//! Single-object transfer primitive plus the terminal rendering of its
//! event stream. The multi-object protocol lives in [`crate::sync`].

pub mod error;
pub mod file;
pub mod paths;

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::events::SyncEvent;

pub use error::TransferError;
pub use file::{ResumableTransfer, TransferOutcome};

/// Create a byte progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar`
/// or stdout is not a TTY, so piped output and cron jobs stay clean.
pub fn create_progress_bar(no_progress_bar: bool) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    pb.set_style(style);
    pb
}

/// Drive `pb` from the event stream until the sending side is dropped.
/// Returns the number of objects that completed.
pub async fn render_events(mut rx: UnboundedReceiver<SyncEvent>, pb: ProgressBar) -> usize {
    let mut completed = 0usize;
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::State(state) => {
                pb.suspend(|| tracing::debug!(state = %state, "sync state"));
            }
            SyncEvent::Progress {
                object,
                received,
                total,
                ..
            } => {
                if total > 0 {
                    pb.set_length(total);
                }
                pb.set_position(received);
                pb.set_message(object);
            }
            SyncEvent::Completed { object, message } => {
                completed += 1;
                pb.suspend(|| tracing::info!("{}: {}", object, message));
                pb.reset();
            }
            SyncEvent::Failed { kind, message } => {
                pb.suspend(|| tracing::error!(kind = %kind, "{}", message));
            }
        }
    }
    pb.finish_and_clear();
    completed
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
