use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use url::Url;

use crate::cli::{RootArgs, SyncArgs};
use crate::retry::RetryConfig;
use crate::sync::SyncContext;
use crate::transport::TransportConfig;
use crate::types::SplitPolicy;

/// Staging directory name used when `--download-root` is not given.
const DEFAULT_DOWNLOAD_DIR: &str = ".download";
const HISTORY_DB: &str = "history.db";

/// Local paths shared by every command.
#[derive(Debug, Clone)]
pub struct Roots {
    pub local_root: PathBuf,
    pub download_root: PathBuf,
    pub state_dir: PathBuf,
}

impl Roots {
    pub fn from_args(args: &RootArgs) -> anyhow::Result<Self> {
        let local_root = args
            .local_root
            .as_deref()
            .map(expand_tilde)
            .context("--local-root (or BUNDLESYNC_LOCAL_ROOT) is required")?;
        let download_root = args
            .download_root
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| local_root.join(DEFAULT_DOWNLOAD_DIR));
        Ok(Self {
            local_root,
            download_root,
            state_dir: expand_tilde(&args.state_dir),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join(HISTORY_DB)
    }
}

/// Everything `sync` needs, resolved from the command line.
#[derive(Debug)]
pub struct Config {
    pub remote_root: Url,
    pub roots: Roots,
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    pub split_policy: SplitPolicy,
    pub no_progress_bar: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// The remote root must be an absolute http(s) URL. Query and fragment are
/// dropped since resource URLs are built by appending path segments.
fn parse_remote_root(text: &str) -> anyhow::Result<Url> {
    let mut url =
        Url::parse(text).with_context(|| format!("--remote-url '{}' is not a valid URL", text))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("--remote-url must be an http(s) URL, got '{}'", text);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

impl Config {
    pub fn from_sync_args(args: SyncArgs) -> anyhow::Result<Self> {
        let remote_url = args
            .remote_url
            .filter(|u| !u.trim().is_empty())
            .context("--remote-url (or BUNDLESYNC_REMOTE_URL) is required")?;
        let remote_root = parse_remote_root(remote_url.trim())?;
        if args.timeout_secs == 0 {
            anyhow::bail!("--timeout-secs must be greater than zero");
        }
        let roots = Roots::from_args(&args.roots)?;

        Ok(Self {
            remote_root,
            roots,
            transport: TransportConfig {
                timeout: Duration::from_secs(args.timeout_secs),
            },
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay_secs: args.retry_delay,
                ..RetryConfig::default()
            },
            split_policy: args.identifier_split,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn sync_context(&self) -> SyncContext {
        SyncContext::new(
            self.remote_root.clone(),
            self.roots.local_root.clone(),
            self.roots.download_root.clone(),
        )
        .with_split_policy(self.split_policy)
    }
}
