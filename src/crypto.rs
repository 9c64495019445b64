// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical JSON, content digests and Ed25519 keys.
//!
//! Every record is identified by the SHA-256 of its canonical serialization,
//! and every timestamp is signed over the canonical serialization of its
//! inner `timestamp` object. Canonical form sorts object keys recursively and
//! emits no insignificant whitespace, so two documents with the same content
//! always hash and sign identically regardless of field insertion order.
//!
//! Numbers follow ECMAScript formatting where it matters for real records:
//! a float holding a safe integer (`1.0`, `-0.0`) is written as that integer,
//! so `{"n":1.0}` and `{"n":1}` share a digest.
//!
//! All binary values (digests, keys, signatures) travel as lowercase hex.

use crate::error::{ReplicationError, Result};
use ed25519_dalek::{Signer, Verifier};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a SHA-256 digest in bytes.
pub const DIGEST_BYTES: usize = 32;

/// Serialize `document` in canonical form.
pub fn canonicalize(document: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_canonical(document, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(value, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

/// 2^53, the bound of integers an f64 holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    if let Value::Number(number) = value {
        if let Some(integral) = number.as_f64().filter(|_| number.is_f64()).and_then(safe_integer) {
            out.extend_from_slice(integral.to_string().as_bytes());
            return;
        }
    }
    // Serializing a scalar into a Vec cannot fail.
    let _ = serde_json::to_writer(&mut *out, value);
}

fn safe_integer(float: f64) -> Option<i64> {
    (float.fract() == 0.0 && float.abs() <= MAX_SAFE_INTEGER).then_some(float as i64)
}

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_BYTES]);

impl Digest {
    /// Hash arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Digest of a JSON document's canonical form (its content address).
    pub fn of_document(document: &Value) -> Self {
        Self::of(&canonicalize(document))
    }

    pub fn from_bytes(bytes: [u8; DIGEST_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = ReplicationError;

    /// Parse a 64-character hex digest. Anything else is rejected, so a
    /// parsed digest is always safe to use as a path component.
    fn from_str(s: &str) -> Result<Self> {
        decode_fixed::<DIGEST_BYTES>(s, "digest").map(Self)
    }
}

/// Incremental SHA-256 for streamed content (attachments).
#[derive(Default)]
pub struct DigestWriter(Sha256);

impl DigestWriter {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

/// An Ed25519 verification key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| ReplicationError::Parse(format!("invalid public key: {}", e)))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, &signature.0).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl FromStr for PublicKey {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = decode_fixed::<32>(s, "public key")?;
        Self::from_bytes(&bytes)
    }
}

impl From<ed25519_dalek::VerifyingKey> for PublicKey {
    fn from(key: ed25519_dalek::VerifyingKey) -> Self {
        Self(key)
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_bytes()))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self)
    }
}

impl FromStr for Signature {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = decode_fixed::<64>(s, "signature")?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }
}

/// An Ed25519 signing key.
pub struct Keypair(ed25519_dalek::SigningKey);

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(secret))
    }

    /// Parse a hex-encoded 32-byte secret seed.
    pub fn from_hex(s: &str) -> Result<Self> {
        decode_fixed::<32>(s, "secret key").map(|bytes| Self::from_secret(&bytes))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `signed` under `key`.
pub fn verify_signature(signature: &Signature, signed: &[u8], key: &PublicKey) -> bool {
    key.verify(signed, signature)
}

fn decode_fixed<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let s = s.trim();
    if s.len() != N * 2 {
        return Err(ReplicationError::Parse(format!(
            "{} must be {} hex characters, got {}",
            what,
            N * 2,
            s.len()
        )));
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| ReplicationError::Parse(format!("invalid {} hex: {}", what, e)))?;
    Ok(out)
}
