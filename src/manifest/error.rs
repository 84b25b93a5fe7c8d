use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to fetch {name}: {source}")]
    Fetch {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("{name} is not a JSON array of strings: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{list} names {name:?}, which is not a plain file name")]
    InvalidName { list: String, name: String },

    #[error("remote version marker {text:?} is not an integer")]
    VersionParse { text: String },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
