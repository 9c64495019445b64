//! This server's signing identity.
//!
//! Every record this server stores, whether replicated or published locally,
//! gets a receipt timestamp signed with the server's own key.

use crate::crypto::{Digest, Keypair, PublicKey};
use crate::error::{ReplicationError, Result};
use crate::record::{SignedTimestamp, Timestamp};
use std::path::Path;
use tracing::info;

/// Signing key plus the public hostname used in timestamp URIs.
#[derive(Debug)]
pub struct Identity {
    keypair: Keypair,
    hostname: String,
}

impl Identity {
    pub fn new(keypair: Keypair, hostname: impl Into<String>) -> Self {
        Self {
            keypair,
            hostname: hostname.into(),
        }
    }

    /// Load a hex-encoded secret seed from `path`.
    pub async fn load(path: impl AsRef<Path>, hostname: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ReplicationError::storage(path, e))?;
        let keypair = Keypair::from_hex(&text)
            .map_err(|e| ReplicationError::Config(format!("{}: {}", path.display(), e)))?;
        let identity = Self::new(keypair, hostname);
        info!(public_key = %identity.public_key(), "Loaded server identity");
        Ok(identity)
    }

    /// Write a fresh secret seed to `path`, refusing to overwrite.
    pub async fn generate(path: impl AsRef<Path>, hostname: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let keypair = Keypair::generate();
        let created =
            crate::store::write_if_absent(path, keypair.secret_hex().as_bytes()).await?;
        if !created {
            return Err(ReplicationError::Config(format!(
                "{} already exists",
                path.display()
            )));
        }
        Ok(Self::new(keypair, hostname))
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// URI this server serves `digest` at.
    pub fn publication_uri(&self, digest: &Digest) -> String {
        format!("https://{}/publications/{}", self.hostname, digest)
    }

    /// Sign a receipt timestamp for `digest` at `time`.
    pub fn receipt(&self, digest: &Digest, time: &str, version: &str) -> Result<SignedTimestamp> {
        let timestamp = Timestamp {
            digest: digest.to_string(),
            uri: self.publication_uri(digest),
            time: time.to_string(),
        };
        let signature = self.keypair.sign(&timestamp.signing_bytes()?);
        Ok(SignedTimestamp {
            timestamp,
            signature: signature.to_string(),
            version: version.to_string(),
        })
    }
}
