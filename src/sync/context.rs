//! Addressing for one local content root and the remote it mirrors.

use std::path::{Path, PathBuf};

use url::Url;

use crate::types::{SplitPolicy, Version};

/// Plain-text integer naming the current remote version.
pub const REMOTE_VERSION_FILE: &str = "BuildVersion.version";
/// JSON array of manifest segment names, per version.
pub const PACKAGE_LIST: &str = "AllPackages";
/// JSON array of object identifiers, per version. This is the diffed manifest.
pub const HASH_TABLE: &str = "AssetBundleHashs";
/// Sentinel object fetched last in every batch.
pub const LOCAL_INDEX: &str = "LocalAssets";
/// Local version pointer under the local root.
pub const LOCAL_VERSION_FILE: &str = "LocalVersion.version";
/// Ledger file under the download root.
pub const LEDGER_FILE: &str = "LocalDownloadInfo";
/// Cross-process lock under the local root.
pub const LOCK_FILE: &str = ".bundlesync.lock";

/// Everything the orchestrator needs to know about where things live.
/// Built by the caller and handed to [`SyncOrchestrator::new`](super::SyncOrchestrator::new).
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// Base URL of the remote store, e.g. `http://host:8080/BuildOutput`.
    pub remote_root: Url,
    /// Promoted content, one directory per version.
    pub local_root: PathBuf,
    /// Staging area for in-progress syncs.
    pub download_root: PathBuf,
    pub split_policy: SplitPolicy,
}

impl SyncContext {
    pub fn new(
        remote_root: Url,
        local_root: impl Into<PathBuf>,
        download_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote_root,
            local_root: local_root.into(),
            download_root: download_root.into(),
            split_policy: SplitPolicy::default(),
        }
    }

    pub fn with_split_policy(mut self, policy: SplitPolicy) -> Self {
        self.split_policy = policy;
        self
    }

    pub fn remote_version_url(&self) -> Url {
        self.resource_url(&[REMOTE_VERSION_FILE])
    }

    /// URL of `name` under version `version`. `name` is percent-encoded as a
    /// single path segment.
    pub fn remote_url(&self, version: Version, name: &str) -> Url {
        let version = version.to_string();
        self.resource_url(&[version.as_str(), name])
    }

    fn resource_url(&self, segments: &[&str]) -> Url {
        let mut url = self.remote_root.clone();
        // Only cannot-be-a-base URLs (`mailto:`, `data:`) lack a path, and
        // those never reach here as a remote root.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn staging_dir(&self, version: Version) -> PathBuf {
        self.download_root.join(version.to_string())
    }

    pub fn local_version_dir(&self, version: Version) -> PathBuf {
        self.local_root.join(version.to_string())
    }

    pub fn local_version_pointer(&self) -> PathBuf {
        self.local_root.join(LOCAL_VERSION_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.download_root.join(LEDGER_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.local_root.join(LOCK_FILE)
    }

    /// Name of the remote object that backs a manifest identifier.
    pub fn object_name<'a>(&self, identifier: &'a str) -> &'a str {
        self.split_policy.object_name(identifier)
    }

    /// Where the object for `identifier` lands inside `dir`.
    pub fn object_path(&self, dir: &Path, identifier: &str) -> PathBuf {
        dir.join(self.object_name(identifier))
    }
}
