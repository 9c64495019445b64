// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by what went wrong with an accession (transport,
//! parsing, validation, integrity, authenticity, storage) and include the
//! context needed to find the offending peer, digest or file.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Connection failure, timeout, body read error |
//! | `HttpStatus` | 5xx/429 | Peer answered with a non-success status |
//! | `Parse` | No | Malformed JSON, CSV line, hex encoding |
//! | `SchemaValidation` | No | Document fails its JSON schema |
//! | `Integrity` | No | Recomputed digest does not match |
//! | `Authenticity` | No | Signature does not verify |
//! | `Storage` | No | Local filesystem failure |
//! | `MalformedRegistry` | No | Unparsable peer registry line |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Nothing inside a cycle is retried: a failed accession stops that peer
//! until the next cycle, which resumes from the last committed cursor.
//! [`ReplicationError::is_retryable()`] tells operators (and logs) whether the
//! next cycle is likely to succeed without intervention.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Request to a peer failed before a response body was fully read.
    #[error("Transport error ({peer}, {operation}): {message}")]
    Transport {
        peer: String,
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Peer answered with a non-success HTTP status.
    #[error("Peer {peer} answered {operation} with HTTP {status}")]
    HttpStatus {
        peer: String,
        operation: String,
        status: u16,
    },

    /// Malformed JSON document, CSV line or text encoding.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Document failed JSON schema validation.
    #[error("Invalid {kind}: {}", .errors.join("; "))]
    SchemaValidation { kind: String, errors: Vec<String> },

    /// Recomputed digest does not match the announced one.
    #[error("Integrity error ({context}): expected {expected}, computed {actual}")]
    Integrity {
        context: String,
        expected: String,
        actual: String,
    },

    /// Signature did not verify under the claimed key.
    #[error("Authenticity error: {0}")]
    Authenticity(String),

    /// Local filesystem failure.
    #[error("Storage error ({}): {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A peer registry line could not be parsed.
    ///
    /// The loader logs and skips these; the variant exists so the line
    /// parser can report what was wrong.
    #[error("Malformed peer registry line {line}: {message}")]
    MalformedRegistry { line: usize, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error from a reqwest error.
    pub fn transport(
        peer: impl Into<String>,
        operation: impl Into<String>,
        source: reqwest::Error,
    ) -> Self {
        Self::Transport {
            peer: peer.into(),
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(
        peer: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            peer: peer.into(),
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error for `path`.
    pub fn storage(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create an integrity error.
    pub fn integrity(
        context: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::Integrity {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Parse(_) => false,
            Self::SchemaValidation { .. } => false,
            Self::Integrity { .. } => false,
            Self::Authenticity(_) => false,
            Self::Storage { .. } => false, // Local disk issues need attention
            Self::MalformedRegistry { .. } => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } | Self::HttpStatus { .. } => "transport",
            Self::Parse(_) => "parse",
            Self::SchemaValidation { .. } => "schema",
            Self::Integrity { .. } => "integrity",
            Self::Authenticity(_) => "authenticity",
            Self::Storage { .. } => "storage",
            Self::MalformedRegistry { .. } => "registry",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
