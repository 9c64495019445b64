// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer transport.
//!
//! [`PeerSource`] is everything the replication pipeline needs from a remote
//! peer: the accession feed, records, timestamps and attachment bodies.
//! [`HttpPeer`] implements it over the peer's HTTP API:
//!
//! ```text
//! GET {base}/accessions?from={n}                              text/csv
//! GET {base}/publications/{digest}                            application/json
//! GET {base}/publications/{digest}/timestamps/{signer-hex}    application/json
//! GET {base}/publications/{digest}/attachments/{attachment}   raw bytes + Content-Type
//! ```
//!
//! Any non-2xx status is a hard failure ([`ReplicationError::HttpStatus`]).
//! Nothing is retried here: a failed request fails the accession, and the
//! next cycle resumes from the committed cursor.
//!
//! The trait allows testing with an in-memory mock network and decouples the
//! synchronizer from `reqwest`.

use crate::config::HttpConfig;
use crate::crypto::{Digest, PublicKey};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::registry::Peer;
use crate::resilience::RateLimiter;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Content type stored for attachments whose peer sent none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A response body read incrementally.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// An attachment body and the content type the peer declared for it.
pub struct AttachmentBody {
    pub content_type: String,
    pub body: ByteStream,
}

impl std::fmt::Debug for AttachmentBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentBody")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Trait defining what we need from a remote peer.
pub trait PeerSource: Send + Sync + 'static {
    /// Short name for logs and metric labels.
    fn label(&self) -> &str;

    /// Open the accession feed starting at accession number `from`.
    fn accessions(&self, from: u64) -> BoxFuture<'_, ByteStream>;

    /// Fetch the record body for `digest`.
    fn fetch_record(&self, digest: Digest) -> BoxFuture<'_, Value>;

    /// Fetch the timestamp `signer` issued for `digest`.
    fn fetch_timestamp(&self, digest: Digest, signer: PublicKey) -> BoxFuture<'_, Value>;

    /// Open one attachment of the record `digest`.
    fn fetch_attachment(&self, digest: Digest, attachment: Digest) -> BoxFuture<'_, AttachmentBody>;
}

/// Builds a [`PeerSource`] for a registry entry.
///
/// The driver connects once per peer per cycle.
pub trait PeerConnector: Send + Sync + 'static {
    type Source: PeerSource;

    fn connect(&self, peer: &Peer) -> Result<Self::Source>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Creates [`HttpPeer`]s sharing one connection pool and rate limiter.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    request_timeout: Duration,
    idle_timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
}

impl HttpConnector {
    /// Build the shared HTTP client from config.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout_duration())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ReplicationError::Config(format!("HTTP client: {}", e)))?;
        let limiter = config
            .rate_limit_config()
            .map(|rate| Arc::new(RateLimiter::new(rate)));

        Ok(Self {
            client,
            request_timeout: config.request_timeout_duration(),
            idle_timeout: config.idle_timeout_duration(),
            limiter,
        })
    }
}

impl PeerConnector for HttpConnector {
    type Source = HttpPeer;

    fn connect(&self, peer: &Peer) -> Result<HttpPeer> {
        Ok(HttpPeer {
            client: self.client.clone(),
            base: peer.endpoint.as_str().trim_end_matches('/').to_string(),
            label: peer.label(),
            request_timeout: self.request_timeout,
            idle_timeout: self.idle_timeout,
            limiter: self.limiter.clone(),
        })
    }
}

/// One peer's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: Client,
    base: String,
    label: String,
    request_timeout: Duration,
    idle_timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
}

impl HttpPeer {
    /// Issue a GET and return the response if its status is 2xx.
    ///
    /// `request_timeout` bounds the wait for the response head only. Bodies
    /// are bounded per chunk by [`idle_timeout`](HttpConfig::idle_timeout).
    async fn get(&self, operation: &'static str, path: &str, accept: &str) -> Result<Response> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = format!("{}{}", self.base, path);
        debug!(peer = %self.label, %url, operation, "GET");

        let start = Instant::now();
        let request = self.client.get(&url).header(ACCEPT, accept).send();
        let response = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(response) => {
                response.map_err(|e| ReplicationError::transport(&self.label, operation, e))?
            }
            Err(_) => {
                return Err(ReplicationError::transport_msg(
                    &self.label,
                    operation,
                    format!("no response within {:?}", self.request_timeout),
                ))
            }
        };
        metrics::record_peer_request_latency(&self.label, operation, start.elapsed());

        let status = response.status();
        if !status.is_success() {
            return Err(ReplicationError::HttpStatus {
                peer: self.label.clone(),
                operation: operation.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json(&self, operation: &'static str, path: &str) -> Result<Value> {
        let response = self.get(operation, path, "application/json").await?;
        if let Some(length) = response.content_length() {
            if length > MAX_DOCUMENT_BYTES as u64 {
                return Err(ReplicationError::Parse(format!(
                    "{} from {}: document of {} bytes exceeds {}",
                    operation, self.label, length, MAX_DOCUMENT_BYTES
                )));
            }
        }
        let body = read_document(self.body_stream(response), MAX_DOCUMENT_BYTES)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidData => {
                    ReplicationError::Parse(format!("{} from {}: {}", operation, self.label, e))
                }
                _ => ReplicationError::transport_msg(&self.label, operation, e.to_string()),
            })?;
        serde_json::from_slice(&body).map_err(|e| {
            ReplicationError::Parse(format!("{} from {}: {}", operation, self.label, e))
        })
    }

    fn body_stream(&self, response: Response) -> ByteStream {
        let chunks: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        with_idle_timeout(chunks, self.idle_timeout)
    }
}

/// Largest JSON document (record or timestamp) accepted from a peer.
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Fail `body` with [`TimedOut`](std::io::ErrorKind::TimedOut) when no chunk
/// arrives for `idle`. The body as a whole may take as long as it needs.
pub fn with_idle_timeout(body: ByteStream, idle: Duration) -> ByteStream {
    Box::pin(futures::stream::unfold(Some(body), move |body| async move {
        let mut body = body?;
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(body))),
            Ok(None) => None,
            Err(_) => Some((
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("body idle for {:?}", idle),
                )),
                None,
            )),
        }
    }))
}

/// Collect a body of at most `limit` bytes into memory.
///
/// A longer body fails with [`InvalidData`](std::io::ErrorKind::InvalidData).
pub async fn read_document(mut body: ByteStream, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if out.len() + chunk.len() > limit {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("body exceeds {} bytes", limit),
            ));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

impl PeerSource for HttpPeer {
    fn label(&self) -> &str {
        &self.label
    }

    fn accessions(&self, from: u64) -> BoxFuture<'_, ByteStream> {
        Box::pin(async move {
            let path = format!("/accessions?from={}", from);
            let response = self.get("accessions", &path, "text/csv").await?;
            Ok(self.body_stream(response))
        })
    }

    fn fetch_record(&self, digest: Digest) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            self.get_json("fetch_record", &format!("/publications/{}", digest))
                .await
        })
    }

    fn fetch_timestamp(&self, digest: Digest, signer: PublicKey) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            self.get_json(
                "fetch_timestamp",
                &format!("/publications/{}/timestamps/{}", digest, signer),
            )
            .await
        })
    }

    fn fetch_attachment(&self, digest: Digest, attachment: Digest) -> BoxFuture<'_, AttachmentBody> {
        Box::pin(async move {
            let path = format!("/publications/{}/attachments/{}", digest, attachment);
            let response = self.get("fetch_attachment", &path, "*/*").await?;
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string();
            Ok(AttachmentBody {
                content_type,
                body: self.body_stream(response),
            })
        })
    }
}
