//! The sync protocol.
//!
//! One [`SyncOrchestrator::sync`] call walks
//! `ResolvingRemoteVersion → FetchingManifest → ComputingDiff →
//! TransferringObjects → Finalizing` and ends in `UpToDate` or `Failed`.
//! Objects are transferred strictly one after another and each completion
//! is written to the ledger before the next starts, so a failed or killed
//! sync resumes from the first unfinished object.

pub mod context;
pub mod error;
mod finalize;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use fs4::fs_std::FileExt;
use tokio::fs;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use context::SyncContext;
pub use error::SyncError;

use crate::download::{ResumableTransfer, TransferError};
use crate::events::{ErrorKind, EventSink, SyncEvent};
use crate::manifest::{self, is_plain_name, Manifest, ManifestError, ManifestStore};
use crate::state::{DownloadInfoLedger, StateDb, SyncOutcome, SyncRunStats};
use crate::transport::HttpClient;
use crate::types::Version;
use context::{HASH_TABLE, LOCAL_INDEX, PACKAGE_LIST};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    ResolvingRemoteVersion,
    FetchingManifest,
    ComputingDiff,
    TransferringObjects,
    Finalizing,
    UpToDate,
    Failed(ErrorKind),
}

impl SyncState {
    /// True while a sync owns the content root.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle | Self::UpToDate | Self::Failed(_))
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::ResolvingRemoteVersion => f.write_str("resolving remote version"),
            Self::FetchingManifest => f.write_str("fetching manifest"),
            Self::ComputingDiff => f.write_str("computing diff"),
            Self::TransferringObjects => f.write_str("transferring objects"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::UpToDate => f.write_str("up to date"),
            Self::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// What a successful sync did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub from_version: Option<Version>,
    pub to_version: Version,
    pub additions: BTreeSet<String>,
    /// Reported only. Stale objects stay in older version directories.
    pub removals: BTreeSet<String>,
    /// Identifiers fetched in this call, in transfer order.
    pub transferred: Vec<String>,
    /// Identifiers an earlier, interrupted call had already finished.
    pub skipped: Vec<String>,
}

impl SyncReport {
    fn unchanged(version: Version) -> Self {
        Self {
            from_version: Some(version),
            to_version: version,
            additions: BTreeSet::new(),
            removals: BTreeSet::new(),
            transferred: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Whether a new version was promoted.
    pub fn updated(&self) -> bool {
        self.from_version != Some(self.to_version)
    }
}

/// Holds the busy state claimed by [`SyncOrchestrator::sync`]. If the sync
/// future is dropped before reaching a terminal state, the orchestrator is
/// moved to `Failed(Cancelled)` so later calls are not refused as busy.
struct ClaimGuard<'a> {
    state: &'a watch::Sender<SyncState>,
    events: &'a EventSink,
    armed: bool,
}

impl ClaimGuard<'_> {
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("sync dropped before finishing, partial work kept for the next attempt");
        let state = SyncState::Failed(ErrorKind::Cancelled);
        self.state.send_replace(state.clone());
        self.events.emit(SyncEvent::State(state));
    }
}

#[derive(Debug, Default)]
struct RunTracker {
    run_id: Option<i64>,
    to_version: Option<Version>,
    additions: u64,
    removals: u64,
    transferred: u64,
    skipped: u64,
}

/// Drives syncs for one local content root. Only one sync runs at a time:
/// a second call while one is in flight fails with [`SyncError::Busy`],
/// and a lock file keeps other processes out.
pub struct SyncOrchestrator {
    ctx: SyncContext,
    client: Arc<dyn HttpClient>,
    history: Option<Arc<dyn StateDb>>,
    state: watch::Sender<SyncState>,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("ctx", &self.ctx)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(
        ctx: SyncContext,
        client: Arc<dyn HttpClient>,
        history: Option<Arc<dyn StateDb>>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            ctx,
            client,
            history,
            state,
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Run one sync attempt.
    ///
    /// Nothing is retried here. On failure everything finished so far stays
    /// on disk and in the ledger, and the orchestrator rests in `Failed`
    /// until the next call. Dropping the future has the same effect, with
    /// `Failed(Cancelled)`.
    pub async fn sync(
        &self,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let claimed = self.state.send_if_modified(|state| {
            if state.is_busy() {
                return false;
            }
            *state = SyncState::ResolvingRemoteVersion;
            true
        });
        if !claimed {
            let err = SyncError::Busy {
                root: self.ctx.local_root.clone(),
            };
            tracing::warn!("{}", err);
            events.emit(SyncEvent::Failed {
                kind: err.kind(),
                message: err.to_string(),
            });
            return Err(err);
        }
        let guard = ClaimGuard {
            state: &self.state,
            events,
            armed: true,
        };
        events.emit(SyncEvent::State(SyncState::ResolvingRemoteVersion));

        let mut tracker = RunTracker::default();
        let result = self.run(events, cancel, &mut tracker).await;
        self.record_history(&tracker, &result).await;

        match &result {
            Ok(report) if report.updated() => {
                tracing::info!(
                    version = %report.to_version,
                    transferred = report.transferred.len(),
                    skipped = report.skipped.len(),
                    removals = report.removals.len(),
                    "sync complete"
                );
                self.transition(events, SyncState::UpToDate);
            }
            Ok(_) => self.transition(events, SyncState::UpToDate),
            Err(e) => {
                let kind = e.kind();
                if kind == ErrorKind::Cancelled {
                    tracing::warn!("sync cancelled, partial work kept for the next attempt");
                } else {
                    tracing::error!(kind = %kind, "sync failed: {}", e);
                }
                if !e.already_reported() {
                    events.emit(SyncEvent::Failed {
                        kind,
                        message: e.to_string(),
                    });
                }
                self.transition(events, SyncState::Failed(kind));
            }
        }
        guard.release();
        result
    }

    async fn run(
        &self,
        events: &EventSink,
        cancel: &CancellationToken,
        tracker: &mut RunTracker,
    ) -> Result<SyncReport, SyncError> {
        let _lock = self.lock_root().await?;
        let store = ManifestStore::new(&self.ctx);
        let client = self.client.as_ref();

        let local_version = store.load_local_version().await?;
        tracker.run_id = self.start_history(local_version).await;

        let remote_version = cancellable(cancel, store.fetch_remote_version(client)).await??;
        tracker.to_version = Some(remote_version);
        if local_version == Some(remote_version) {
            tracing::info!(version = %remote_version, "already up to date");
            return Ok(SyncReport::unchanged(remote_version));
        }
        tracing::info!(
            local = local_version.map(|v| v.0),
            remote = remote_version.0,
            "new remote version"
        );
        if let Some(report) = self
            .finish_promoted(&store, local_version, remote_version, events)
            .await?
        {
            return Ok(report);
        }

        self.transition(events, SyncState::FetchingManifest);
        let staging = self.ctx.staging_dir(remote_version);
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| SyncError::disk(&staging, e))?;
        let mut ledger = DownloadInfoLedger::load(self.ctx.ledger_path(), remote_version).await?;
        let lists = self
            .fetch_manifests(&store, remote_version, &mut ledger, cancel)
            .await?;
        ledger
            .reconcile(|id| {
                if lists.contains(id) {
                    staging.join(id)
                } else {
                    self.ctx.object_path(&staging, id)
                }
            })
            .await?;
        if !ledger.is_empty() {
            tracing::info!(
                version = %remote_version,
                finished = ledger.len(),
                "resuming interrupted sync"
            );
        }

        self.transition(events, SyncState::ComputingDiff);
        let remote_manifest = store.load_staged_manifest(remote_version).await?;
        // Objects share staging with the lists, so a name clash would
        // overwrite a manifest.
        if let Some(bad) = remote_manifest.iter().find(|id| {
            let object = self.ctx.object_name(id);
            !is_plain_name(object) || object == LOCAL_INDEX || lists.contains(object)
        }) {
            return Err(ManifestError::InvalidName {
                list: HASH_TABLE.to_string(),
                name: bad.to_string(),
            }
            .into());
        }
        let local_manifest = self.local_manifest(&store, local_version).await;
        let diff = manifest::diff(local_manifest.as_ref(), &remote_manifest);
        tracker.additions = diff.additions.len() as u64;
        tracker.removals = diff.removals.len() as u64;
        tracing::info!(
            additions = diff.additions.len(),
            removals = diff.removals.len(),
            "computed diff"
        );
        for identifier in &diff.removals {
            tracing::debug!(identifier = %identifier, "no longer listed remotely, left in place");
        }

        self.transition(events, SyncState::TransferringObjects);
        let mut transferred = Vec::new();
        let mut skipped = Vec::new();
        let queue = diff
            .additions
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(LOCAL_INDEX));
        for identifier in queue {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if ledger.contains(identifier) {
                tracing::debug!(identifier, "finished by an earlier attempt");
                skipped.push(identifier.to_string());
                tracker.skipped += 1;
                continue;
            }
            let object = self.ctx.object_name(identifier);
            let transfer = ResumableTransfer::new(
                self.ctx.remote_url(remote_version, object),
                staging.join(object),
            );
            if let Err(source) = transfer.run(client, events, cancel).await {
                if matches!(source, TransferError::ContentEmpty { .. }) {
                    discard_complete_temp(transfer.temp_path()).await;
                }
                return Err(SyncError::Transfer {
                    identifier: identifier.to_string(),
                    source,
                });
            }
            ledger.record(identifier).await?;
            transferred.push(identifier.to_string());
            tracker.transferred += 1;
        }

        self.transition(events, SyncState::Finalizing);
        if let (Some(old), Some(local)) = (local_version, local_manifest.as_ref()) {
            self.carry_forward(old, remote_version, local, &remote_manifest, &staging)
                .await?;
        }
        let target = self.ctx.local_version_dir(remote_version);
        finalize::promote(&staging, &target)
            .await
            .map_err(|source| SyncError::Finalize {
                version: remote_version,
                source,
            })?;
        store_pointer(&store, remote_version).await?;
        if let Err(e) = ledger.clear().await {
            tracing::warn!("version promoted but the ledger could not be removed: {}", e);
        }

        Ok(SyncReport {
            from_version: local_version,
            to_version: remote_version,
            additions: diff.additions,
            removals: diff.removals,
            transferred,
            skipped,
        })
    }

    async fn local_manifest(
        &self,
        store: &ManifestStore<'_>,
        version: Option<Version>,
    ) -> Option<Manifest> {
        let version = version?;
        let manifest = store.load_local_manifest(version).await;
        if manifest.is_none() {
            tracing::warn!(version = %version, "no readable local manifest, fetching everything");
        }
        manifest
    }

    /// Complete a sync that was interrupted after its version directory was
    /// promoted but before the pointer was written. That leaves the target
    /// directory in place, no staging directory, and a ledger bound to the
    /// target version. Returns `None` unless every listed object is present.
    async fn finish_promoted(
        &self,
        store: &ManifestStore<'_>,
        local_version: Option<Version>,
        remote_version: Version,
        events: &EventSink,
    ) -> Result<Option<SyncReport>, SyncError> {
        let target = self.ctx.local_version_dir(remote_version);
        if !path_exists(&target).await || path_exists(&self.ctx.staging_dir(remote_version)).await {
            return Ok(None);
        }
        let ledger_path = self.ctx.ledger_path();
        match DownloadInfoLedger::inspect(&ledger_path).await? {
            Some(pending) if pending.version == remote_version => {}
            _ => return Ok(None),
        }
        let Some(promoted) = store.load_local_manifest(remote_version).await else {
            return Ok(None);
        };
        for path in promoted
            .iter()
            .map(|id| self.ctx.object_path(&target, id))
            .chain(std::iter::once(target.join(LOCAL_INDEX)))
        {
            if !path_exists(&path).await {
                tracing::debug!(path = %path.display(), "promoted version incomplete");
                return Ok(None);
            }
        }

        tracing::info!(version = %remote_version, "version already promoted, writing pointer");
        self.transition(events, SyncState::Finalizing);
        let local_manifest = self.local_manifest(store, local_version).await;
        let diff = manifest::diff(local_manifest.as_ref(), &promoted);
        store_pointer(store, remote_version).await?;
        let ledger = DownloadInfoLedger::load(ledger_path, remote_version).await?;
        if let Err(e) = ledger.clear().await {
            tracing::warn!("version promoted but the ledger could not be removed: {}", e);
        }
        Ok(Some(SyncReport {
            from_version: local_version,
            to_version: remote_version,
            additions: diff.additions,
            removals: diff.removals,
            transferred: Vec::new(),
            skipped: Vec::new(),
        }))
    }

    /// Fetch the package list, every segment it names, and the hash table,
    /// persisting each into staging and recording it in the ledger. Returns
    /// the names of everything fetched.
    async fn fetch_manifests(
        &self,
        store: &ManifestStore<'_>,
        version: Version,
        ledger: &mut DownloadInfoLedger,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<String>, SyncError> {
        let client = self.client.as_ref();
        let (raw, segments) =
            cancellable(cancel, store.fetch_list(client, version, PACKAGE_LIST)).await??;
        store.persist_list(version, PACKAGE_LIST, &raw).await?;
        ledger.record(PACKAGE_LIST).await?;

        let mut fetched = BTreeSet::from([PACKAGE_LIST.to_string()]);
        for name in segments
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(HASH_TABLE))
        {
            if !is_plain_name(name) {
                return Err(ManifestError::InvalidName {
                    list: PACKAGE_LIST.to_string(),
                    name: name.to_string(),
                }
                .into());
            }
            if !fetched.insert(name.to_string()) {
                continue;
            }
            let (raw, _) = cancellable(cancel, store.fetch_list(client, version, name)).await??;
            store.persist_list(version, name, &raw).await?;
            ledger.record(name).await?;
            tracing::debug!(list = name, "fetched manifest");
        }
        tracing::info!(lists = fetched.len(), version = %version, "manifests fetched");
        Ok(fetched)
    }

    /// Link objects listed in both manifests from the current local version
    /// into staging, so the promoted directory is complete on its own.
    async fn carry_forward(
        &self,
        old: Version,
        new: Version,
        local: &Manifest,
        remote: &Manifest,
        staging: &Path,
    ) -> Result<(), SyncError> {
        let old_dir = self.ctx.local_version_dir(old);
        let mut carried = 0usize;
        for identifier in local.iter().filter(|id| remote.contains(id)) {
            let from = self.ctx.object_path(&old_dir, identifier);
            if !path_exists(&from).await {
                tracing::warn!(
                    identifier,
                    path = %from.display(),
                    "unchanged object missing from the local version, not carried forward"
                );
                continue;
            }
            let to = self.ctx.object_path(staging, identifier);
            finalize::link_or_copy(&from, &to)
                .await
                .map_err(|source| SyncError::Finalize {
                    version: new,
                    source,
                })?;
            carried += 1;
        }
        tracing::debug!(carried, from = %old, "carried unchanged objects forward");
        Ok(())
    }

    async fn lock_root(&self) -> Result<std::fs::File, SyncError> {
        let root = self.ctx.local_root.clone();
        let lock_path = self.ctx.lock_path();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root).map_err(|e| SyncError::disk(&root, e))?;
            let file =
                std::fs::File::create(&lock_path).map_err(|e| SyncError::disk(&lock_path, e))?;
            file.try_lock_exclusive()
                .map_err(|_| SyncError::Busy { root: root.clone() })?;
            Ok::<std::fs::File, SyncError>(file)
        })
        .await
        .map_err(|e| SyncError::disk(self.ctx.lock_path(), std::io::Error::other(e)))?
    }

    fn transition(&self, events: &EventSink, state: SyncState) {
        tracing::debug!(state = %state, "sync state");
        self.state.send_replace(state.clone());
        events.emit(SyncEvent::State(state));
    }

    async fn start_history(&self, from: Option<Version>) -> Option<i64> {
        let history = self.history.as_ref()?;
        match history.start_sync_run(from).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("failed to record sync start: {}", e);
                None
            }
        }
    }

    async fn record_history(&self, tracker: &RunTracker, result: &Result<SyncReport, SyncError>) {
        let (Some(history), Some(run_id)) = (&self.history, tracker.run_id) else {
            return;
        };
        let outcome = match result {
            Ok(report) if report.updated() => SyncOutcome::Updated,
            Ok(_) => SyncOutcome::UpToDate,
            Err(e) if e.kind() == ErrorKind::Cancelled => SyncOutcome::Cancelled,
            Err(_) => SyncOutcome::Failed,
        };
        let stats = SyncRunStats {
            to_version: tracker.to_version,
            additions: tracker.additions,
            removals: tracker.removals,
            transferred: tracker.transferred,
            skipped: tracker.skipped,
            outcome,
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = history.complete_sync_run(run_id, &stats).await {
            tracing::warn!("failed to record sync result: {}", e);
        }
    }
}

/// A pointer write failure means the promoted version is not live yet.
async fn store_pointer(store: &ManifestStore<'_>, version: Version) -> Result<(), SyncError> {
    match store.store_local_version(version).await {
        Ok(()) => Ok(()),
        Err(ManifestError::Io { source, .. }) => Err(SyncError::Finalize { version, source }),
        Err(e) => Err(e.into()),
    }
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// A temp file that already holds the whole object gets an empty answer to
/// its range request. Dropping it lets the next attempt fetch from byte 0.
async fn discard_complete_temp(temp: &Path) {
    match fs::remove_file(temp).await {
        Ok(()) => tracing::info!(path = %temp.display(), "discarded temp file with no bytes left to fetch"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %temp.display(), "cannot remove temp file: {}", e),
    }
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, SyncError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SqliteStateDb, StateDb};
    use crate::transport::testing::FakeRemote;
    use crate::transport::{RangeResponse, TransportError};
    use crate::types::SplitPolicy;
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::{Notify, Semaphore};
    use url::Url;

    const ROOT: &str = "http://remote";

    fn body(object: &str) -> Vec<u8> {
        format!("contents of {}", object).into_bytes()
    }

    fn object_url(version: u64, object: &str) -> String {
        format!("{}/{}/{}", ROOT, version, object)
    }

    fn publish(remote: &FakeRemote, version: u64, ids: &[&str]) {
        let json = serde_json::to_string(ids).unwrap();
        remote.put(&format!("{}/BuildVersion.version", ROOT), version.to_string());
        remote.put(&object_url(version, "AllPackages"), r#"["core"]"#);
        remote.put(&object_url(version, "core"), json.clone());
        remote.put(&object_url(version, "AssetBundleHashs"), json);
        for id in ids {
            let object = SplitPolicy::Last.object_name(id);
            remote.put(&object_url(version, object), body(object));
        }
        remote.put(&object_url(version, "LocalAssets"), body("LocalAssets"));
    }

    fn install_local(ctx: &SyncContext, version: u64, ids: &[&str]) {
        let dir = ctx.local_version_dir(Version(version));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("AssetBundleHashs"), serde_json::to_string(ids).unwrap()).unwrap();
        for id in ids {
            let object = ctx.object_name(id);
            std::fs::write(dir.join(object), body(object)).unwrap();
        }
        std::fs::write(ctx.local_version_pointer(), version.to_string()).unwrap();
    }

    fn setup() -> (tempfile::TempDir, SyncContext, FakeRemote) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SyncContext::new(
            Url::parse(ROOT).unwrap(),
            dir.path().join("local"),
            dir.path().join("download"),
        );
        (dir, ctx, FakeRemote::new())
    }

    fn orchestrator(ctx: &SyncContext, remote: &FakeRemote) -> SyncOrchestrator {
        SyncOrchestrator::new(ctx.clone(), Arc::new(remote.clone()), None)
    }

    async fn sync(orch: &SyncOrchestrator) -> Result<SyncReport, SyncError> {
        orch.sync(&EventSink::disabled(), &CancellationToken::new())
            .await
    }

    fn object_requests(remote: &FakeRemote) -> Vec<(String, u64)> {
        remote
            .requests()
            .into_iter()
            .filter_map(|(url, offset)| offset.map(|o| (url, o)))
            .collect()
    }

    fn local_pointer(ctx: &SyncContext) -> Option<String> {
        std::fs::read_to_string(ctx.local_version_pointer()).ok()
    }

    async fn ledger_entries(ctx: &SyncContext) -> Vec<String> {
        DownloadInfoLedger::inspect(&ctx.ledger_path())
            .await
            .unwrap()
            .map(|s| s.entries)
            .unwrap_or_default()
    }

    fn states(rx: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::State(s) = event {
                states.push(s);
            }
        }
        states
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_equal_versions_take_one_request() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 3, &["h1_a"]);
        install_local(&ctx, 3, &["h1_a"]);
        let orch = orchestrator(&ctx, &remote);
        let (sink, mut rx) = EventSink::channel();

        let report = orch.sync(&sink, &CancellationToken::new()).await.unwrap();

        assert!(!report.updated());
        assert_eq!(remote.request_count(), 1);
        assert_eq!(orch.state(), SyncState::UpToDate);
        assert_eq!(
            states(&mut rx),
            vec![SyncState::ResolvingRemoteVersion, SyncState::UpToDate]
        );
        assert!(!ctx.staging_dir(Version(3)).exists());
    }

    #[tokio::test]
    async fn test_transfers_only_additions_and_keeps_removals() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 4, &["h2_b", "h3_c", "h4_d"]);
        install_local(&ctx, 3, &["h1_a", "h2_b", "h3_c"]);
        let orch = orchestrator(&ctx, &remote);
        let (sink, mut rx) = EventSink::channel();

        let report = orch.sync(&sink, &CancellationToken::new()).await.unwrap();

        assert!(report.updated());
        assert_eq!(report.from_version, Some(Version(3)));
        assert_eq!(report.additions, set(&["h4_d"]));
        assert_eq!(report.removals, set(&["h1_a"]));
        assert_eq!(report.transferred, vec!["h4_d".to_string(), "LocalAssets".into()]);

        let fetched: Vec<String> = object_requests(&remote).into_iter().map(|(u, _)| u).collect();
        assert_eq!(fetched, vec![object_url(4, "d"), object_url(4, "LocalAssets")]);

        let promoted = ctx.local_version_dir(Version(4));
        for object in ["b", "c", "d", "LocalAssets"] {
            assert_eq!(std::fs::read(promoted.join(object)).unwrap(), body(object));
        }
        assert!(promoted.join("AssetBundleHashs").exists());
        assert!(!promoted.join("a").exists());
        assert!(ctx.local_version_dir(Version(3)).join("a").exists());

        assert_eq!(local_pointer(&ctx).as_deref(), Some("4"));
        assert!(!ctx.ledger_path().exists());
        assert!(!ctx.staging_dir(Version(4)).exists());
        assert_eq!(
            states(&mut rx),
            vec![
                SyncState::ResolvingRemoteVersion,
                SyncState::FetchingManifest,
                SyncState::ComputingDiff,
                SyncState::TransferringObjects,
                SyncState::Finalizing,
                SyncState::UpToDate,
            ]
        );
    }

    #[tokio::test]
    async fn test_first_sync_fetches_everything() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 1, &["h1_a", "h2_b"]);
        let orch = orchestrator(&ctx, &remote);

        let report = sync(&orch).await.unwrap();

        assert_eq!(report.from_version, None);
        assert_eq!(report.transferred.len(), 3);
        assert!(report.removals.is_empty());
        let promoted = ctx.local_version_dir(Version(1));
        assert_eq!(std::fs::read(promoted.join("a")).unwrap(), body("a"));
        assert_eq!(std::fs::read(promoted.join("b")).unwrap(), body("b"));
        assert_eq!(local_pointer(&ctx).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_missing_local_manifest_is_full_resync() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        install_local(&ctx, 1, &["h1_a"]);
        std::fs::remove_file(ctx.local_version_dir(Version(1)).join("AssetBundleHashs")).unwrap();
        let orch = orchestrator(&ctx, &remote);

        let report = sync(&orch).await.unwrap();

        assert_eq!(report.additions, set(&["h1_a"]));
        assert!(report.removals.is_empty());
        assert!(report.transferred.contains(&"h1_a".to_string()));
    }

    #[tokio::test]
    async fn test_removal_only_update_still_promotes() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        install_local(&ctx, 1, &["h1_a", "h2_b"]);
        let orch = orchestrator(&ctx, &remote);

        let report = sync(&orch).await.unwrap();

        assert!(report.additions.is_empty());
        assert_eq!(report.transferred, vec!["LocalAssets".to_string()]);
        assert_eq!(local_pointer(&ctx).as_deref(), Some("2"));
        assert!(ctx.local_version_dir(Version(2)).join("a").exists());
    }

    #[tokio::test]
    async fn test_failure_mid_batch_keeps_earlier_work() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a", "h2_b", "h3_c"]);
        remote.fail(&object_url(2, "b"));
        let orch = orchestrator(&ctx, &remote);

        let err = sync(&orch).await.unwrap_err();

        assert!(matches!(&err, SyncError::Transfer { identifier, .. } if identifier == "h2_b"));
        assert_eq!(orch.state(), SyncState::Failed(ErrorKind::Transport));
        let staging = ctx.staging_dir(Version(2));
        assert!(staging.join("a").exists());
        assert!(!staging.join("b").exists());
        assert!(!staging.join("c").exists());
        let entries = ledger_entries(&ctx).await;
        assert!(entries.contains(&"h1_a".to_string()));
        assert!(!entries.contains(&"h2_b".to_string()));
        assert!(!entries.contains(&"h3_c".to_string()));
        assert_eq!(local_pointer(&ctx), None);

        remote.heal(&object_url(2, "b"));
        let report = sync(&orch).await.unwrap();

        assert_eq!(report.skipped, vec!["h1_a".to_string()]);
        assert_eq!(
            report.transferred,
            vec!["h2_b".to_string(), "h3_c".into(), "LocalAssets".into()]
        );
        let a_fetches = object_requests(&remote)
            .iter()
            .filter(|(url, _)| *url == object_url(2, "a"))
            .count();
        assert_eq!(a_fetches, 1);
        assert_eq!(local_pointer(&ctx).as_deref(), Some("2"));
        assert_eq!(orch.state(), SyncState::UpToDate);
    }

    #[tokio::test]
    async fn test_interrupted_object_resumes_from_partial_bytes() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        let url = object_url(2, "a");
        remote.interrupt_after(&url, 5);
        let orch = orchestrator(&ctx, &remote);

        let err = sync(&orch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        let temp = ctx.staging_dir(Version(2)).join("a.temp");
        assert_eq!(std::fs::read(&temp).unwrap(), &body("a")[..5]);

        remote.clear_interrupt(&url);
        sync(&orch).await.unwrap();

        assert!(object_requests(&remote).contains(&(url.clone(), 5)));
        assert_eq!(
            std::fs::read(ctx.local_version_dir(Version(2)).join("a")).unwrap(),
            body("a")
        );
    }

    #[tokio::test]
    async fn test_ledger_entry_without_artifact_is_transferred_again() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a", "h2_b"]);
        remote.fail(&object_url(2, "b"));
        let orch = orchestrator(&ctx, &remote);
        sync(&orch).await.unwrap_err();

        std::fs::remove_file(ctx.staging_dir(Version(2)).join("a")).unwrap();
        remote.heal(&object_url(2, "b"));
        let report = sync(&orch).await.unwrap();

        assert!(report.skipped.is_empty());
        assert!(report.transferred.contains(&"h1_a".to_string()));
        assert!(ctx.local_version_dir(Version(2)).join("a").exists());
    }

    #[tokio::test]
    async fn test_content_empty_object_is_not_recorded() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        remote.put(&object_url(2, "a"), Vec::<u8>::new());
        let orch = orchestrator(&ctx, &remote);
        let (sink, mut rx) = EventSink::channel();

        let err = orch.sync(&sink, &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ContentEmpty);
        let staging = ctx.staging_dir(Version(2));
        assert!(!staging.join("a").exists());
        assert!(!staging.join("a.temp").exists());
        assert!(!ledger_entries(&ctx).await.contains(&"h1_a".to_string()));

        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Failed { kind, .. } = event {
                assert_eq!(kind, ErrorKind::ContentEmpty);
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_complete_temp_file_is_refetched_on_next_attempt() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        let staging = ctx.staging_dir(Version(2));
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("a.temp"), body("a")).unwrap();
        let orch = orchestrator(&ctx, &remote);

        let err = sync(&orch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContentEmpty);
        assert!(!staging.join("a.temp").exists());
        assert!(!ledger_entries(&ctx).await.contains(&"h1_a".to_string()));

        let report = sync(&orch).await.unwrap();

        assert!(report.transferred.contains(&"h1_a".to_string()));
        assert!(object_requests(&remote).contains(&(object_url(2, "a"), 0)));
        assert_eq!(
            std::fs::read(ctx.local_version_dir(Version(2)).join("a")).unwrap(),
            body("a")
        );
        assert_eq!(local_pointer(&ctx).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_object_named_like_a_manifest_is_rejected() {
        for identifier in ["h1_AssetBundleHashs", "h1_core", "h1_LocalAssets"] {
            let (_dir, ctx, remote) = setup();
            publish(&remote, 2, &["h2_b"]);
            let listed = serde_json::to_string(&["h2_b", identifier]).unwrap();
            remote.put(&object_url(2, "core"), listed.clone());
            remote.put(&object_url(2, "AssetBundleHashs"), listed);
            let orch = orchestrator(&ctx, &remote);

            let err = sync(&orch).await.unwrap_err();

            assert_eq!(err.kind(), ErrorKind::ManifestParse, "{}", identifier);
            assert!(object_requests(&remote).is_empty());
            assert_eq!(local_pointer(&ctx), None);
            assert!(!ctx.local_version_dir(Version(2)).exists());
        }
    }

    fn write_ledger(ctx: &SyncContext, json: &str) {
        std::fs::create_dir_all(&ctx.download_root).unwrap();
        std::fs::write(ctx.ledger_path(), json).unwrap();
    }

    #[tokio::test]
    async fn test_promoted_version_without_pointer_is_finished() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a", "h2_b"]);
        let orch = orchestrator(&ctx, &remote);
        sync(&orch).await.unwrap();
        let before = remote.request_count();

        // Crash after the rename into place, before the pointer write.
        std::fs::remove_file(ctx.local_version_pointer()).unwrap();
        write_ledger(
            &ctx,
            r#"{"version":2,"DownloadFileNames":["AllPackages","core","AssetBundleHashs","h1_a","h2_b"]}"#,
        );
        let report = sync(&orch).await.unwrap();

        assert_eq!(remote.request_count(), before + 1);
        assert!(report.updated());
        assert!(report.transferred.is_empty());
        assert_eq!(report.additions, set(&["h1_a", "h2_b"]));
        assert_eq!(local_pointer(&ctx).as_deref(), Some("2"));
        assert!(!ctx.ledger_path().exists());
        assert_eq!(orch.state(), SyncState::UpToDate);
    }

    #[tokio::test]
    async fn test_incomplete_promoted_version_is_synced_again() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a", "h2_b"]);
        let orch = orchestrator(&ctx, &remote);
        sync(&orch).await.unwrap();

        std::fs::remove_file(ctx.local_version_pointer()).unwrap();
        std::fs::remove_file(ctx.local_version_dir(Version(2)).join("b")).unwrap();
        write_ledger(&ctx, r#"{"version":2,"DownloadFileNames":["h1_a","h2_b"]}"#);
        let report = sync(&orch).await.unwrap();

        assert_eq!(report.transferred.len(), 3);
        assert_eq!(
            std::fs::read(ctx.local_version_dir(Version(2)).join("b")).unwrap(),
            body("b")
        );
        assert_eq!(local_pointer(&ctx).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_manifest_fetch_failure_changes_nothing() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 4, &["h1_a"]);
        install_local(&ctx, 3, &["h1_a"]);
        remote.fail(&object_url(4, "AssetBundleHashs"));
        let orch = orchestrator(&ctx, &remote);

        let err = sync(&orch).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ManifestFetch);
        assert_eq!(orch.state(), SyncState::Failed(ErrorKind::ManifestFetch));
        assert!(object_requests(&remote).is_empty());
        assert_eq!(local_pointer(&ctx).as_deref(), Some("3"));
        assert!(!ctx.local_version_dir(Version(4)).exists());
    }

    #[tokio::test]
    async fn test_unparsable_remote_version() {
        let (_dir, ctx, remote) = setup();
        remote.put(&format!("{}/BuildVersion.version", ROOT), "<html>");
        let orch = orchestrator(&ctx, &remote);

        let err = sync(&orch).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::VersionParse);
        assert!(!ctx.download_root.exists());
        assert_eq!(local_pointer(&ctx), None);
    }

    #[tokio::test]
    async fn test_segment_name_escaping_staging_is_rejected() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        remote.put(&object_url(2, "AllPackages"), r#"["../evil"]"#);
        let orch = orchestrator(&ctx, &remote);

        let err = sync(&orch).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ManifestParse);
    }

    #[tokio::test]
    async fn test_cancel_between_transfers() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a", "h2_b"]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        remote.after_body(&object_url(2, "a"), move || trigger.cancel());
        let orch = orchestrator(&ctx, &remote);

        let err = orch.sync(&EventSink::disabled(), &cancel).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(orch.state(), SyncState::Failed(ErrorKind::Cancelled));
        assert!(ctx.staging_dir(Version(2)).join("a").exists());
        assert!(ledger_entries(&ctx).await.contains(&"h1_a".to_string()));
        assert!(!object_requests(&remote)
            .iter()
            .any(|(url, _)| *url == object_url(2, "b")));
        assert_eq!(local_pointer(&ctx), None);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orch = orchestrator(&ctx, &remote);

        let err = orch.sync(&EventSink::disabled(), &cancel).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_history_records_runs() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        install_local(&ctx, 1, &[]);
        let db = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let orch = SyncOrchestrator::new(ctx.clone(), Arc::new(remote.clone()), Some(db.clone()));

        sync(&orch).await.unwrap();
        sync(&orch).await.unwrap();

        let runs = db.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].outcome, Some(SyncOutcome::UpToDate));
        assert_eq!(runs[1].outcome, Some(SyncOutcome::Updated));
        assert_eq!(runs[1].from_version, Some(Version(1)));
        assert_eq!(runs[1].to_version, Some(Version(2)));
        assert_eq!(runs[1].transferred, 2);
    }

    /// Holds text requests until permits are added.
    struct GatedRemote {
        remote: FakeRemote,
        gate: Arc<Semaphore>,
        arrived: Arc<Notify>,
    }

    impl GatedRemote {
        fn new(remote: &FakeRemote) -> (Self, Arc<Semaphore>, Arc<Notify>) {
            let gate = Arc::new(Semaphore::new(0));
            let arrived = Arc::new(Notify::new());
            let client = Self {
                remote: remote.clone(),
                gate: gate.clone(),
                arrived: arrived.clone(),
            };
            (client, gate, arrived)
        }
    }

    #[async_trait]
    impl HttpClient for GatedRemote {
        async fn get_text(&self, url: &str) -> Result<String, TransportError> {
            self.arrived.notify_one();
            let _permit = self.gate.acquire().await.unwrap();
            self.remote.get_text(url).await
        }

        async fn get_from(&self, url: &str, offset: u64) -> Result<RangeResponse, TransportError> {
            self.remote.get_from(url, offset).await
        }
    }

    #[tokio::test]
    async fn test_second_sync_while_running_is_busy() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        let (client, gate, _) = GatedRemote::new(&remote);
        let orch = Arc::new(SyncOrchestrator::new(ctx.clone(), Arc::new(client), None));

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { sync(&orch).await }
        });
        let mut watcher = orch.subscribe();
        watcher.wait_for(|s| s.is_busy()).await.unwrap();

        let (sink, mut rx) = EventSink::channel();
        let err = orch.sync(&sink, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Busy { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::Failed {
                kind: ErrorKind::Busy,
                ..
            }
        ));
        assert!(orch.state().is_busy());

        gate.add_permits(100);
        first.await.unwrap().unwrap();
        assert_eq!(orch.state(), SyncState::UpToDate);
        assert_eq!(local_pointer(&ctx).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_dropped_sync_releases_the_orchestrator() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        let (client, gate, arrived) = GatedRemote::new(&remote);
        let orch = Arc::new(SyncOrchestrator::new(ctx.clone(), Arc::new(client), None));
        let mut watcher = orch.subscribe();

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { sync(&orch).await }
        });
        arrived.notified().await;
        assert!(orch.state().is_busy());

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());
        watcher.wait_for(|s| !s.is_busy()).await.unwrap();
        assert_eq!(orch.state(), SyncState::Failed(ErrorKind::Cancelled));

        gate.add_permits(100);
        let report = sync(&orch).await.unwrap();
        assert_eq!(report.to_version, Version(2));
        assert_eq!(orch.state(), SyncState::UpToDate);
        assert_eq!(local_pointer(&ctx).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_other_process_holding_lock_is_busy() {
        let (_dir, ctx, remote) = setup();
        publish(&remote, 2, &["h1_a"]);
        std::fs::create_dir_all(&ctx.local_root).unwrap();
        let held = std::fs::File::create(ctx.lock_path()).unwrap();
        held.try_lock_exclusive().unwrap();
        let orch = orchestrator(&ctx, &remote);

        let err = sync(&orch).await.unwrap_err();

        assert!(matches!(err, SyncError::Busy { .. }));
        assert_eq!(remote.request_count(), 0);
        assert_eq!(orch.state(), SyncState::Failed(ErrorKind::Busy));
    }
}
