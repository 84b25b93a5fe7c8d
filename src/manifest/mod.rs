//! Versioned manifests: the set of content-object identifiers that exist
//! at one version, plus the diff between two of them.

pub mod diff;
pub mod error;
pub mod store;

use std::collections::BTreeSet;

pub use diff::{diff, VersionDiff};
pub use error::ManifestError;
pub use store::ManifestStore;

/// Set of identifiers valid at one version. Order carries no meaning;
/// duplicates in the serialized form collapse to one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    ids: BTreeSet<String>,
}

impl Manifest {
    /// Parse a JSON array of identifier strings.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw = parse_names(text)?;
        let listed = raw.len();
        let manifest: Manifest = raw.into_iter().collect();
        if manifest.len() < listed {
            tracing::warn!(
                listed,
                unique = manifest.len(),
                "manifest lists duplicate identifiers, keeping one of each"
            );
        }
        Ok(manifest)
    }

    #[cfg(test)]
    pub fn to_json(&self) -> String {
        // Serializing a set of strings cannot fail.
        serde_json::to_string(&self.ids).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn ids(&self) -> &BTreeSet<String> {
        &self.ids
    }
}

impl<S: Into<String>> FromIterator<S> for Manifest {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Names from the remote become path components; anything that could
/// leave the version directory is rejected.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// Parse a JSON array of names, keeping order and duplicates.
pub fn parse_names(text: &str) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str(text)
}
