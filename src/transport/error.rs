use thiserror::Error;

/// Failures raised by an [`HttpClient`](super::HttpClient).
///
/// A failure before the response headers arrive, timeouts included, is
/// `Request`. A body that breaks off after the headers is `Interrupted`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("connection to {url} interrupted: {message}")]
    Interrupted { url: String, message: String },
}

impl TransportError {
    /// Server errors, rate limits and dropped connections are transient;
    /// other HTTP statuses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            TransportError::Request { .. } => true,
            TransportError::Interrupted { .. } => true,
        }
    }
}
