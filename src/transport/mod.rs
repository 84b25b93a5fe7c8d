//! HTTP capability used by the sync core.
//!
//! The core only needs two things from the network: small text resources
//! (version marker, manifests) and byte streams starting at an offset.
//! [`HttpClient`] abstracts both so tests can run against an in-memory
//! remote; [`ReqwestClient`] is the production implementation.

pub mod error;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};

pub use error::TransportError;

/// Body chunks as they arrive from the wire.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response to a range request, handed over as soon as headers arrive.
pub struct RangeResponse {
    /// HTTP status: 206 when the range was honored, 200 when the server sent
    /// the whole object, 416 when nothing lies past the offset.
    pub status: u16,
    /// Length of the body that follows (the remaining bytes), if announced.
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET a small text resource.
    async fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// GET `url` with `Range: bytes=<offset>-`.
    async fn get_from(&self, url: &str, offset: u64) -> Result<RangeResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout, covering the whole body.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(config: &TransportConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("bundlesync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.to_string(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        response.text().await.map_err(|e| TransportError::Request {
            url: url.to_string(),
            source: e,
        })
    }

    async fn get_from(&self, url: &str, offset: u64) -> Result<RangeResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-", offset))
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status();
        tracing::debug!(url, offset, status = status.as_u16(), "range response");

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(RangeResponse {
                status: status.as_u16(),
                content_length: Some(0),
                body: futures_util::stream::empty().boxed(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_length = response.content_length();
        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| TransportError::Interrupted {
                    url: owned_url.clone(),
                    message: if e.is_timeout() {
                        format!("timed out mid-body: {}", e)
                    } else {
                        e.to_string()
                    },
                })
            })
            .boxed();

        Ok(RangeResponse {
            status: status.as_u16(),
            content_length,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::body::Body;
    use axum::extract::{Path, Request};
    use axum::http::{header, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::*;
    use crate::download::ResumableTransfer;
    use crate::events::{ErrorKind, EventSink};
    use crate::sync::SyncContext;
    use crate::types::Version;

    const STALL: Duration = Duration::from_secs(5);

    const TEST_SIZE: usize = 64 * 1024;

    fn test_body() -> Vec<u8> {
        (0..TEST_SIZE).map(|i| (i % 251) as u8).collect()
    }

    async fn serve_object(req: Request) -> axum::response::Response {
        let body = test_body();
        let total = body.len();
        if let Some(start) = req
            .headers()
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.strip_suffix('-'))
            .and_then(|v| v.parse::<usize>().ok())
        {
            if start >= total {
                return AxumStatus::RANGE_NOT_SATISFIABLE.into_response();
            }
            let slice = body[start..].to_vec();
            return (
                AxumStatus::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, total - 1, total),
                )],
                slice,
            )
                .into_response();
        }
        (AxumStatus::OK, body).into_response()
    }

    /// Sends the first ten bytes of a 206 body, then goes quiet.
    async fn serve_stalled_body() -> axum::response::Response {
        let first = futures_util::stream::once(async {
            Ok::<_, std::io::Error>(Bytes::from_static(b"0123456789"))
        });
        let rest = futures_util::stream::once(async {
            tokio::time::sleep(STALL).await;
            Ok::<_, std::io::Error>(Bytes::from_static(b"late"))
        });
        (AxumStatus::PARTIAL_CONTENT, Body::from_stream(first.chain(rest))).into_response()
    }

    async fn start_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let app = Router::new()
            .route("/root/BuildVersion.version", get(|| async { "7\n" }))
            .route("/root/7/object", get(serve_object))
            .route("/root/7/:name", get(|Path(name): Path<String>| async move { name }))
            .route(
                "/root/stalled",
                get(|| async {
                    tokio::time::sleep(STALL).await;
                    "late"
                }),
            )
            .route("/root/7/stalled-body", get(serve_stalled_body));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle)
    }

    async fn collect(mut body: BodyStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_get_text() {
        let (addr, _handle) = start_server().await;
        let client = ReqwestClient::new(&TransportConfig::default()).unwrap();
        let text = client
            .get_text(&format!("http://{}/root/BuildVersion.version", addr))
            .await
            .unwrap();
        assert_eq!(text.trim(), "7");
    }

    #[tokio::test]
    async fn test_get_text_404_is_status_error() {
        let (addr, _handle) = start_server().await;
        let client = ReqwestClient::new(&TransportConfig::default()).unwrap();
        let err = client
            .get_text(&format!("http://{}/root/missing", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_get_from_offset_returns_remaining_bytes() {
        let (addr, _handle) = start_server().await;
        let client = ReqwestClient::new(&TransportConfig::default()).unwrap();
        let resp = client
            .get_from(&format!("http://{}/root/7/object", addr), 1000)
            .await
            .unwrap();
        assert_eq!(resp.status, 206);
        assert_eq!(resp.content_length, Some((TEST_SIZE - 1000) as u64));
        let data = collect(resp.body).await;
        assert_eq!(data, test_body()[1000..].to_vec());
    }

    #[tokio::test]
    async fn test_get_from_past_end_is_416() {
        let (addr, _handle) = start_server().await;
        let client = ReqwestClient::new(&TransportConfig::default()).unwrap();
        let resp = client
            .get_from(&format!("http://{}/root/7/object", addr), TEST_SIZE as u64)
            .await
            .unwrap();
        assert_eq!(resp.status, 416);
        assert_eq!(resp.content_length, Some(0));
    }

    fn short_timeout_client() -> ReqwestClient {
        ReqwestClient::new(&TransportConfig {
            timeout: Duration::from_millis(300),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_stalled_headers_time_out_as_request_error() {
        let (addr, _handle) = start_server().await;
        let client = short_timeout_client();
        let url = format!("http://{}/root/stalled", addr);

        let err = client.get_text(&url).await.unwrap_err();
        assert!(matches!(&err, TransportError::Request { source, .. } if source.is_timeout()));
        assert!(err.is_retryable());

        let err = client.get_from(&url, 0).await.unwrap_err();
        assert!(matches!(&err, TransportError::Request { source, .. } if source.is_timeout()));
    }

    #[tokio::test]
    async fn test_stalled_body_is_interrupted() {
        let (addr, _handle) = start_server().await;
        let client = short_timeout_client();
        let resp = client
            .get_from(&format!("http://{}/root/7/stalled-body", addr), 0)
            .await
            .unwrap();
        assert_eq!(resp.status, 206);

        let mut body = resp.body;
        let mut received = 0;
        let err = loop {
            match body.next().await {
                Some(Ok(chunk)) => received += chunk.len(),
                Some(Err(e)) => break e,
                None => panic!("body ended without an error"),
            }
        };
        assert_eq!(received, 10);
        assert!(matches!(err, TransportError::Interrupted { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_timed_out_transfer_keeps_partial_temp_file() {
        let (addr, _handle) = start_server().await;
        let client = short_timeout_client();
        let dir = tempfile::tempdir().unwrap();
        let transfer = ResumableTransfer::new(
            format!("http://{}/root/7/stalled-body", addr),
            dir.path().join("stalled-body"),
        );
        std::fs::write(transfer.temp_path(), [0u8; 10]).unwrap();

        let err = transfer
            .run(&client, &EventSink::disabled(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
        let temp = std::fs::read(transfer.temp_path()).unwrap();
        assert_eq!(temp.len(), 20);
        assert_eq!(&temp[10..], b"0123456789");
        assert!(!dir.path().join("stalled-body").exists());
    }

    #[tokio::test]
    async fn test_remote_names_are_sent_escaped() {
        let (addr, _handle) = start_server().await;
        let client = ReqwestClient::new(&TransportConfig::default()).unwrap();
        let root = Url::parse(&format!("http://{}/root/", addr)).unwrap();
        let ctx = SyncContext::new(root, "/local", "/download");

        for name in ["object#v2", "object?v=2", "a b%c"] {
            let url = ctx.remote_url(Version(7), name);
            assert_eq!(client.get_text(url.as_str()).await.unwrap(), name);
        }
        let plain = ctx.remote_url(Version(7), "object");
        let resp = client.get_from(plain.as_str(), 0).await.unwrap();
        assert_eq!(collect(resp.body).await, test_body());
    }
}
