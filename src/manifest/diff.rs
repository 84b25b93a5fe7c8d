use std::collections::BTreeSet;

use super::Manifest;

/// What has to happen to move a local cache onto a remote manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDiff {
    /// Present remotely, absent locally: to fetch.
    pub additions: BTreeSet<String>,
    /// Present locally, absent remotely: stale, reported but never deleted here.
    pub removals: BTreeSet<String>,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Diff a local manifest against a remote one.
///
/// `None` means no local manifest could be read: everything remote is an
/// addition and nothing is a removal. An empty local manifest is a real
/// manifest and diffs normally.
pub fn diff(local: Option<&Manifest>, remote: &Manifest) -> VersionDiff {
    let Some(local) = local else {
        return VersionDiff {
            additions: remote.ids().clone(),
            removals: BTreeSet::new(),
        };
    };
    VersionDiff {
        additions: remote.ids().difference(local.ids()).cloned().collect(),
        removals: local.ids().difference(remote.ids()).cloned().collect(),
    }
}
