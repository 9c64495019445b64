// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned JSON schemas for publications and timestamps.
//!
//! Each document kind has one or more schemas keyed by semantic version.
//! A document pins the schema it was written against with its `version`
//! string; documents without a pin are checked against the latest schema.
//!
//! Schemas are compiled once. [`Schemas::builtin()`] holds the schemas that
//! ship with the crate as process-wide immutable state; tests and embedders
//! can build their own set with [`Schemas::from_sources()`].

use crate::error::{ReplicationError, Result};
use semver::Version;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

const PUBLICATION_1_0_0: &str = include_str!("../schemas/publication-1.0.0.json");
const TIMESTAMP_1_0_0: &str = include_str!("../schemas/timestamp-1.0.0.json");

static BUILTIN: OnceLock<Arc<Schemas>> = OnceLock::new();

/// The kinds of document the replication pipeline validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchemaKind {
    Publication,
    Timestamp,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Publication => write!(f, "publication"),
            SchemaKind::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// One schema source, before compilation.
#[derive(Debug, Clone)]
pub struct SchemaSource {
    pub kind: SchemaKind,
    pub version: Version,
    pub schema: Value,
}

impl SchemaSource {
    pub fn new(kind: SchemaKind, version: Version, schema: Value) -> Self {
        Self {
            kind,
            version,
            schema,
        }
    }

    fn from_text(kind: SchemaKind, version: &str, text: &str) -> Result<Self> {
        let version = Version::parse(version)
            .map_err(|e| ReplicationError::Config(format!("bad schema version {}: {}", version, e)))?;
        let schema = serde_json::from_str(text)
            .map_err(|e| ReplicationError::Config(format!("bad {} schema: {}", kind, e)))?;
        Ok(Self::new(kind, version, schema))
    }
}

/// A set of compiled, versioned schemas.
pub struct Schemas {
    validators: BTreeMap<SchemaKind, BTreeMap<Version, jsonschema::Validator>>,
}

impl Schemas {
    /// The schemas shipped with the crate, compiled on first use.
    pub fn builtin() -> Result<Arc<Schemas>> {
        if let Some(schemas) = BUILTIN.get() {
            return Ok(Arc::clone(schemas));
        }
        let compiled = Arc::new(Self::from_sources(vec![
            SchemaSource::from_text(SchemaKind::Publication, "1.0.0", PUBLICATION_1_0_0)?,
            SchemaSource::from_text(SchemaKind::Timestamp, "1.0.0", TIMESTAMP_1_0_0)?,
        ])?);
        // Another thread may have won the race; either value is identical.
        let _ = BUILTIN.set(compiled);
        BUILTIN
            .get()
            .cloned()
            .ok_or_else(|| ReplicationError::Internal("builtin schemas not initialised".into()))
    }

    /// Compile a schema set from explicit sources.
    ///
    /// Every kind must have at least one schema.
    pub fn from_sources(sources: Vec<SchemaSource>) -> Result<Self> {
        let mut validators: BTreeMap<SchemaKind, BTreeMap<Version, jsonschema::Validator>> =
            BTreeMap::new();

        for source in sources {
            let validator = jsonschema::validator_for(&source.schema).map_err(|e| {
                ReplicationError::Config(format!(
                    "{} schema {} does not compile: {}",
                    source.kind, source.version, e
                ))
            })?;
            validators
                .entry(source.kind)
                .or_default()
                .insert(source.version, validator);
        }

        for kind in [SchemaKind::Publication, SchemaKind::Timestamp] {
            if !validators.contains_key(&kind) {
                return Err(ReplicationError::Config(format!("no {} schema provided", kind)));
            }
        }

        Ok(Self { validators })
    }

    /// Greatest known version for `kind`.
    pub fn latest(&self, kind: SchemaKind) -> Option<&Version> {
        self.validators
            .get(&kind)
            .and_then(|versions| versions.keys().next_back())
    }

    /// Validate `document` against the schema `pinned` selects, or the
    /// latest one. Returns the structural errors; empty means valid.
    pub fn validate(&self, kind: SchemaKind, document: &Value, pinned: Option<&Version>) -> Vec<String> {
        let Some(versions) = self.validators.get(&kind) else {
            return vec![format!("no {} schema available", kind)];
        };

        let validator = match pinned {
            Some(version) => match versions.get(version) {
                Some(validator) => validator,
                None => return vec![format!("unsupported {} schema version {}", kind, version)],
            },
            None => match versions.values().next_back() {
                Some(validator) => validator,
                None => return vec![format!("no {} schema available", kind)],
            },
        };

        validator.iter_errors(document).map(|e| e.to_string()).collect()
    }

    /// Validate using the version the document pins in its `version` field.
    pub fn validate_document(&self, kind: SchemaKind, document: &Value) -> Vec<String> {
        match pinned_version(document) {
            Ok(pinned) => self.validate(kind, document, pinned.as_ref()),
            Err(message) => vec![message],
        }
    }

    /// Like [`validate_document`](Self::validate_document), as a `Result`.
    pub fn check(&self, kind: SchemaKind, document: &Value) -> Result<()> {
        let errors = self.validate_document(kind, document);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReplicationError::SchemaValidation {
                kind: kind.to_string(),
                errors,
            })
        }
    }
}

impl fmt::Debug for Schemas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (kind, versions) in &self.validators {
            let versions: Vec<String> = versions.keys().map(|v| v.to_string()).collect();
            map.entry(kind, &versions);
        }
        map.finish()
    }
}

/// The schema version a document pins, if any.
fn pinned_version(document: &Value) -> std::result::Result<Option<Version>, String> {
    match document.get("version") {
        None => Ok(None),
        Some(Value::String(s)) => Version::parse(s)
            .map(Some)
            .map_err(|e| format!("version {:?} is not a semantic version: {}", s, e)),
        Some(other) => Err(format!("version must be a string, got {}", other)),
    }
}
