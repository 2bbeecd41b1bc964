use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use url::Url;

use crate::digest::Digest;
use crate::error;

/// A dispatched response: status plus a byte stream lifted to AsyncRead.
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

/// The round-trip seam under the resumable transport. Production code
/// uses the reqwest implementation; tests substitute canned responses.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, url: &Url, range: Option<&str>) -> crate::Result<TransportResponse>;
}

/// Performs plain HTTP GETs with reqwest. Authentication is the concern
/// of the caller configuring the client (default headers etc).
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl RoundTripper for ReqwestTransport {
    async fn round_trip(&self, url: &Url, range: Option<&str>) -> crate::Result<TransportResponse> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        let response = request.send().await.context(error::RequestSnafu)?;
        Ok(TransportResponse {
            status: response.status(),
            body: Box::new(StreamReader::new(
                response.bytes_stream().map_err(std::io::Error::other),
            )),
        })
    }
}

/// Extract the digest hex from a registry blob path of the shape
/// `/v2/<name>/blobs/sha256:<hex>`. Anything else is not resumable.
fn blob_digest_hex(path: &str) -> Option<&str> {
    let (_, tail) = path.rsplit_once("/blobs/")?;
    let hex = tail.strip_prefix("sha256:")?;
    (hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())).then_some(hex)
}

/// Decorates a round-tripper with HTTP Range resumption for blob GETs.
/// The expected offset per digest is injected by the store from the size
/// of its `.incomplete` sidecar; whether a request actually resumed is
/// tracked separately so observation is independent of mutation.
pub struct ResumableTransport {
    inner: Arc<dyn RoundTripper>,
    offsets: Mutex<HashMap<String, u64>>,
    resumed: Mutex<HashMap<String, bool>>,
}

impl ResumableTransport {
    pub fn new(inner: Arc<dyn RoundTripper>) -> Self {
        Self {
            inner,
            offsets: Mutex::new(HashMap::new()),
            resumed: Mutex::new(HashMap::new()),
        }
    }

    /// Record the byte offset the next GET for this digest should resume
    /// from. Zero clears the entry.
    pub fn set_offset(&self, digest: &Digest, offset: u64) {
        let mut offsets = self.offsets.lock().expect("offsets poisoned");
        if offset == 0 {
            offsets.remove(digest.hex());
        } else {
            offsets.insert(digest.hex().to_string(), offset);
        }
    }

    /// Whether the most recent GET for this digest was served as a
    /// partial response.
    pub fn did_resume(&self, digest: &Digest) -> bool {
        self.resumed
            .lock()
            .expect("resumed poisoned")
            .get(digest.hex())
            .copied()
            .unwrap_or(false)
    }

    fn offset_for(&self, hex: &str) -> u64 {
        self.offsets
            .lock()
            .expect("offsets poisoned")
            .get(hex)
            .copied()
            .unwrap_or(0)
    }

    fn record_resume(&self, hex: &str, value: bool) {
        self.resumed
            .lock()
            .expect("resumed poisoned")
            .insert(hex.to_string(), value);
    }

    pub async fn get(&self, url: &Url) -> crate::Result<TransportResponse> {
        let Some(hex) = blob_digest_hex(url.path()).map(str::to_string) else {
            return self.inner.round_trip(url, None).await;
        };
        let offset = self.offset_for(hex.as_str());
        if offset > 0 {
            let range = format!("bytes={offset}-");
            let response = self.inner.round_trip(url, Some(range.as_str())).await?;
            match response.status {
                StatusCode::PARTIAL_CONTENT => {
                    debug!(target: "transport", "resumed blob {hex} at offset {offset}");
                    self.record_resume(hex.as_str(), true);
                    return Ok(response);
                }
                // Full body despite the range request; use it as-is
                StatusCode::OK => {
                    self.record_resume(hex.as_str(), false);
                    return Ok(response);
                }
                // Stale offset; retry without the range header
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    debug!(target: "transport", "range for blob {hex} not satisfiable, restarting");
                    self.record_resume(hex.as_str(), false);
                }
                _ => {
                    self.record_resume(hex.as_str(), false);
                    return Ok(response);
                }
            }
        } else {
            self.record_resume(hex.as_str(), false);
        }
        self.inner.round_trip(url, None).await
    }
}

/// Map a non-success blob response status onto the error taxonomy.
pub(crate) fn status_error(status: StatusCode, path: &str) -> crate::error::Error {
    match status {
        StatusCode::UNAUTHORIZED => error::Error::Authorization {
            reason: format!("server rejected credentials for '{path}'"),
        },
        StatusCode::NOT_FOUND => error::Error::RemoteNotFound {
            path: path.to_string(),
        },
        _ => error::Error::RemoteStatus {
            status,
            path: path.to_string(),
        },
    }
}

/// A blob addressable over a transport; the remote half of a layer's
/// source.
#[derive(Clone)]
pub struct RemoteBlob {
    transport: Arc<ResumableTransport>,
    url: Url,
    digest: Digest,
}

impl RemoteBlob {
    pub fn new(transport: Arc<ResumableTransport>, url: Url, digest: Digest) -> Self {
        Self {
            transport,
            url,
            digest,
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Open the blob for reading. The stream starts at the transport's
    /// recorded offset when the server honors the range request.
    pub async fn open(&self) -> crate::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let response = self.transport.get(&self.url).await?;
        if !response.status.is_success() {
            return Err(status_error(response.status, self.url.path()));
        }
        Ok(response.body)
    }

    pub fn transport(&self) -> &Arc<ResumableTransport> {
        &self.transport
    }
}
