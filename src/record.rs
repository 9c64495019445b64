//! Publication records and signed timestamps.
//!
//! Records stay as [`serde_json::Value`]: their schema is versioned and the
//! replication pipeline only needs to hash them, validate them and read the
//! attachment list. Timestamps have a fixed shape and get typed structs.

use crate::crypto::{canonicalize, Digest, PublicKey, Signature};
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The signed body of a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Hex digest of the record this timestamp attests.
    pub digest: String,
    /// Where the signer serves the record.
    pub uri: String,
    /// Claimed publication (or receipt) time, ISO-8601.
    pub time: String,
}

impl Timestamp {
    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(canonicalize(&serde_json::to_value(self)?))
    }
}

/// A timestamp plus its detached signature, as stored and served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTimestamp {
    pub timestamp: Timestamp,
    pub signature: String,
    pub version: String,
}

impl SignedTimestamp {
    /// Parse a schema-checked timestamp document.
    pub fn from_value(document: &Value) -> Result<Self> {
        Ok(Self::deserialize(document)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// The digest this timestamp attests.
    pub fn digest(&self) -> Result<Digest> {
        self.timestamp.digest.parse()
    }

    /// Check the signature under `signer`.
    ///
    /// Signs over the canonical form of the inner `timestamp` object.
    pub fn verify(&self, signer: &PublicKey) -> Result<()> {
        let signature: Signature = self.signature.parse()?;
        if signer.verify(&self.timestamp.signing_bytes()?, &signature) {
            Ok(())
        } else {
            Err(ReplicationError::Authenticity(format!(
                "timestamp for {} not signed by {}",
                self.timestamp.digest, signer
            )))
        }
    }
}

/// Attachment digests a record references.
///
/// Missing `attachments` means none. Entries that are not valid digests are
/// a parse error (the schema normally rejects them first).
pub fn attachment_digests(record: &Value) -> Result<Vec<Digest>> {
    match record.get("attachments") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| {
                        ReplicationError::Parse(format!("attachment entry is not a string: {}", item))
                    })?
                    .parse()
            })
            .collect(),
        Some(other) => Err(ReplicationError::Parse(format!(
            "attachments must be an array, got {}",
            other
        ))),
    }
}

/// Current UTC time in the format timestamps and the accession log use.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
