// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer registry: who we replicate from and how far we got.
//!
//! The registry is a flat text file, `{root}/peers`, one peer per line:
//!
//! ```text
//! https://peer.example.org/,3b6a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b59da29,42
//! ```
//!
//! Fields are the peer's endpoint, its hex Ed25519 public key, and `last`,
//! the highest accession number already reconciled from that peer.
//!
//! ## Cursor Semantics
//!
//! The cursor stores the **last fully reconciled** accession. On the next
//! cycle we resume from `last + 1`.
//!
//! ```text
//! read accession 42 → reconcile → peer.last = 42 → end of cycle → save
//!                     (crash here = re-read 42, idempotent)
//! ```
//!
//! The registry is written only by the driver once every peer run for the
//! cycle has finished, so there are no concurrent writers. Saves replace the
//! file atomically (write temp file, then rename).

use crate::crypto::PublicKey;
use crate::error::{ReplicationError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

const REGISTRY_FILE: &str = "peers";

/// A replication peer and our cursor into its accession feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Base URL of the peer's HTTP API.
    pub endpoint: Url,
    /// Key the peer signs its timestamps with.
    pub public_key: PublicKey,
    /// Highest accession number already reconciled.
    pub last: u64,
}

impl Peer {
    pub fn new(endpoint: Url, public_key: PublicKey, last: u64) -> Self {
        Self {
            endpoint,
            public_key,
            last,
        }
    }

    /// Short name for logs and metric labels.
    pub fn label(&self) -> String {
        match (self.endpoint.host_str(), self.endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => self.endpoint.to_string(),
        }
    }

    /// Move the cursor forward to `accession`. Never moves it back.
    pub fn advance(&mut self, accession: u64) {
        if accession > self.last {
            self.last = accession;
        }
    }

    /// Parse one registry line.
    pub fn parse_line(line: &str, number: usize) -> Result<Self> {
        let malformed = |message: String| ReplicationError::MalformedRegistry {
            line: number,
            message,
        };

        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() != 3 {
            return Err(malformed(format!("expected 3 fields, got {}", fields.len())));
        }

        let endpoint = Url::parse(fields[0].trim())
            .map_err(|e| malformed(format!("bad endpoint {:?}: {}", fields[0], e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(malformed(format!("endpoint {:?} cannot be a base URL", fields[0])));
        }
        let public_key: PublicKey = fields[1]
            .parse()
            .map_err(|e| malformed(format!("bad public key: {}", e)))?;
        let last: u64 = fields[2]
            .trim()
            .parse()
            .map_err(|e| malformed(format!("bad accession number {:?}: {}", fields[2], e)))?;

        Ok(Self::new(endpoint, public_key, last))
    }

    /// Render as one registry line (no newline).
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.endpoint, self.public_key, self.last)
    }
}

/// Flat-file peer registry.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    path: PathBuf,
}

impl PeerRegistry {
    /// Registry stored in `directory`.
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every well-formed peer.
    ///
    /// A missing file is an empty registry. Malformed lines are logged and
    /// skipped.
    pub async fn load(&self) -> Result<Vec<Peer>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No peer registry, no peers");
                return Ok(Vec::new());
            }
            Err(e) => return Err(ReplicationError::storage(&self.path, e)),
        };

        let peers = parse_registry(&text);
        info!(
            path = %self.path.display(),
            count = peers.len(),
            "Loaded peer registry"
        );
        Ok(peers)
    }

    /// Replace the registry with `peers`.
    pub async fn save(&self, peers: &[Peer]) -> Result<()> {
        let mut data = String::new();
        for peer in peers {
            data.push_str(&peer.to_line());
            data.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| ReplicationError::storage(&tmp, e))?;
        file.write_all(data.as_bytes())
            .await
            .map_err(|e| ReplicationError::storage(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| ReplicationError::storage(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ReplicationError::storage(&self.path, e))?;

        debug!(path = %self.path.display(), count = peers.len(), "Saved peer registry");
        Ok(())
    }
}

/// Parse registry text, skipping blank and malformed lines.
pub fn parse_registry(text: &str) -> Vec<Peer> {
    let mut peers = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match Peer::parse_line(line, index + 1) {
            Ok(peer) => peers.push(peer),
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed peer registry line");
            }
        }
    }
    peers
}
