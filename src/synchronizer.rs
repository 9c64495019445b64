// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-accession synchronization.
//!
//! Each accession a peer announces goes through a fixed sequence of stages.
//! Which stages do work is decided once, by the probe:
//!
//! ```text
//! Pending ──probe──→ Probed ──fetch──→ Fetched ──validate──→ Validated
//!                                                                │
//!            Committed ←──advance── Logged ←──log── Persisted ←──┘
//! ```
//!
//! | Stage | Runs when | Work |
//! |-------|-----------|------|
//! | probe | always | record present? peer timestamp present? (parallel) |
//! | fetch | record or timestamp missing | GET record / GET timestamp (parallel) |
//! | validate | record missing | schema, then digest |
//! | validate | timestamp missing | schema, embedded digest, signature |
//! | persist | record missing | directory, own receipt, record, attachments |
//! | persist | timestamp missing | peer timestamp |
//! | log | record missing | append to the accession log |
//! | commit | always | `peer.last = max(peer.last, number)` |
//!
//! A record that is already present can also be re-read and its digest
//! checked before the cursor moves past it (`recheck_known_records`).
//!
//! # Failure
//!
//! Any stage error rolls back every file created by this attempt, leaves
//! the cursor where it was and is returned to the caller. Files another
//! writer created are never touched: persistence uses exclusive create and
//! only files this attempt created are tracked.

use crate::crypto::{canonicalize, Digest, DigestWriter};
use crate::error::{ReplicationError, Result};
use crate::identity::Identity;
use crate::metrics;
use crate::peer::PeerSource;
use crate::record::{attachment_digests, now_iso8601, SignedTimestamp};
use crate::registry::Peer;
use crate::resilience::Bulkhead;
use crate::schema::{SchemaKind, Schemas};
use crate::store::{create_new, ContentStore, WrittenFiles};
use crate::stream::Accession;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, trace, warn};

/// Stage of one accession's reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Pending,
    Probed,
    Fetched,
    Validated,
    Persisted,
    Logged,
    Committed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Probed => "probed",
            Stage::Fetched => "fetched",
            Stage::Validated => "validated",
            Stage::Persisted => "persisted",
            Stage::Logged => "logged",
            Stage::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// What the probe found locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub has_record: bool,
    pub has_timestamp: bool,
}

impl Probe {
    /// Record must be fetched, validated, persisted and logged.
    pub fn needs_record(&self) -> bool {
        !self.has_record
    }

    /// Peer timestamp must be fetched, validated and persisted.
    pub fn needs_timestamp(&self) -> bool {
        !self.has_timestamp
    }

    /// The stored record must be read back.
    pub fn reads_stored_record(&self, recheck_known_records: bool) -> bool {
        self.has_record && (recheck_known_records || self.needs_timestamp())
    }
}

/// Result of a successful [`Synchronizer::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// New record stored and logged.
    Stored,
    /// Record was known; the peer's timestamp was added.
    Countersigned,
    /// Record and peer timestamp were both already stored.
    AlreadyPresent,
}

/// Working state of one attempt.
struct Attempt {
    accession: Accession,
    stage: Stage,
    probe: Probe,
    record: Option<Value>,
    /// Raw timestamp document, persisted in canonical form.
    timestamp: Option<Value>,
    /// This attempt wrote the record file. Another peer run may win the race.
    created_record: bool,
    written: WrittenFiles,
}

impl Attempt {
    fn new(accession: Accession) -> Self {
        Self {
            accession,
            stage: Stage::Pending,
            probe: Probe {
                has_record: false,
                has_timestamp: false,
            },
            record: None,
            timestamp: None,
            created_record: false,
            written: WrittenFiles::new(),
        }
    }

    fn digest(&self) -> Digest {
        self.accession.digest
    }

    fn enter(&mut self, next: Stage) {
        trace!(accession = self.accession.number, from = %self.stage, to = %next, "Stage");
        self.stage = next;
    }
}

/// Reconciles single accessions into the local store.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    store: ContentStore,
    schemas: Arc<Schemas>,
    identity: Arc<Identity>,
    max_concurrent_attachments: usize,
    recheck_known_records: bool,
}

impl Synchronizer {
    pub fn new(store: ContentStore, schemas: Arc<Schemas>, identity: Arc<Identity>) -> Self {
        Self {
            store,
            schemas,
            identity,
            max_concurrent_attachments: 8,
            recheck_known_records: true,
        }
    }

    /// Limit concurrent attachment downloads per accession.
    pub fn with_max_concurrent_attachments(mut self, max: usize) -> Self {
        self.max_concurrent_attachments = max.max(1);
        self
    }

    /// Re-verify stored records before advancing past them.
    pub fn with_recheck_known_records(mut self, recheck: bool) -> Self {
        self.recheck_known_records = recheck;
        self
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Reconcile one accession from `source` and advance `peer.last`.
    ///
    /// On error nothing this call created is left behind and `peer.last` is
    /// unchanged.
    ///
    /// Attempts on the same digest, from any peer or a local publish, run one
    /// at a time.
    pub async fn sync<S: PeerSource>(
        &self,
        peer: &mut Peer,
        source: &S,
        accession: Accession,
    ) -> Result<SyncOutcome> {
        let _exclusive = self.store.lock_digest(&accession.digest).await;
        let mut attempt = Attempt::new(accession);

        match self.run(peer, source, &mut attempt).await {
            Ok(outcome) => {
                match outcome {
                    SyncOutcome::Stored => metrics::record_accession_synced(source.label()),
                    _ => metrics::record_accession_skipped(source.label()),
                }
                metrics::set_peer_cursor(source.label(), peer.last);
                Ok(outcome)
            }
            Err(e) => {
                let summary = attempt.written.rollback().await;
                metrics::record_rollback(summary.removed, summary.failed);
                metrics::record_accession_failed(source.label(), e.kind());
                error!(
                    peer = %source.label(),
                    accession = accession.number,
                    digest = %accession.digest,
                    stage = %attempt.stage,
                    kind = e.kind(),
                    removed = summary.removed,
                    error = %e,
                    "Accession failed, rolled back"
                );
                Err(e)
            }
        }
    }

    async fn run<S: PeerSource>(
        &self,
        peer: &mut Peer,
        source: &S,
        attempt: &mut Attempt,
    ) -> Result<SyncOutcome> {
        loop {
            match attempt.stage {
                Stage::Pending => {
                    self.probe(peer, attempt).await?;
                    attempt.enter(Stage::Probed);
                }
                Stage::Probed => {
                    self.fetch(peer, source, attempt).await?;
                    attempt.enter(Stage::Fetched);
                }
                Stage::Fetched => {
                    self.validate(peer, attempt)?;
                    attempt.enter(Stage::Validated);
                }
                Stage::Validated => {
                    self.persist(peer, source, attempt).await?;
                    attempt.enter(Stage::Persisted);
                }
                Stage::Persisted => {
                    if attempt.created_record {
                        self.store
                            .append_accession(&now_iso8601(), &attempt.digest())
                            .await?;
                    }
                    attempt.enter(Stage::Logged);
                }
                Stage::Logged => {
                    peer.advance(attempt.accession.number);
                    attempt.enter(Stage::Committed);
                }
                Stage::Committed => break,
            }
        }

        let outcome = if attempt.created_record {
            info!(
                peer = %peer.label(),
                accession = attempt.accession.number,
                digest = %attempt.digest(),
                files = attempt.written.len(),
                "Stored new record"
            );
            SyncOutcome::Stored
        } else if attempt.probe.needs_timestamp() {
            debug!(accession = attempt.accession.number, digest = %attempt.digest(), "Added peer timestamp");
            SyncOutcome::Countersigned
        } else {
            debug!(accession = attempt.accession.number, digest = %attempt.digest(), "Already present");
            SyncOutcome::AlreadyPresent
        };
        Ok(outcome)
    }

    // =========================================================================
    // Stages
    // =========================================================================

    async fn probe(&self, peer: &Peer, attempt: &mut Attempt) -> Result<()> {
        let digest = attempt.digest();
        let (has_record, has_timestamp) = tokio::join!(
            self.store.has_record(&digest),
            self.store.has_timestamp(&digest, &peer.public_key),
        );
        attempt.probe = Probe {
            has_record: has_record?,
            has_timestamp: has_timestamp?,
        };
        debug!(
            accession = attempt.accession.number,
            digest = %digest,
            has_record = attempt.probe.has_record,
            has_timestamp = attempt.probe.has_timestamp,
            "Probed"
        );
        Ok(())
    }

    async fn fetch<S: PeerSource>(&self, peer: &Peer, source: &S, attempt: &mut Attempt) -> Result<()> {
        let digest = attempt.digest();
        let probe = attempt.probe;

        let record = async {
            if probe.needs_record() {
                source.fetch_record(digest).await.map(Some)
            } else if probe.reads_stored_record(self.recheck_known_records) {
                self.store.read_record(&digest).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let timestamp = async {
            if probe.needs_timestamp() {
                source.fetch_timestamp(digest, peer.public_key).await.map(Some)
            } else {
                Ok(None)
            }
        };

        let (record, timestamp) = tokio::join!(record, timestamp);
        attempt.record = record?;
        attempt.timestamp = timestamp?;
        Ok(())
    }

    fn validate(&self, peer: &Peer, attempt: &mut Attempt) -> Result<()> {
        let digest = attempt.digest();

        if let Some(record) = &attempt.record {
            if attempt.probe.needs_record() {
                self.schemas.check(SchemaKind::Publication, record)?;
            }
            let actual = Digest::of_document(record);
            if actual != digest {
                let context = if attempt.probe.needs_record() {
                    "record from peer"
                } else {
                    "stored record"
                };
                return Err(ReplicationError::integrity(context, digest, actual));
            }
        }

        if let Some(document) = &attempt.timestamp {
            self.schemas.check(SchemaKind::Timestamp, document)?;
            let timestamp = SignedTimestamp::from_value(document)?;
            let attested = timestamp.digest()?;
            if attested != digest {
                return Err(ReplicationError::integrity("peer timestamp", digest, attested));
            }
            timestamp.verify(&peer.public_key)?;
        }

        debug!(accession = attempt.accession.number, digest = %digest, "Validated");
        Ok(())
    }

    async fn persist<S: PeerSource>(&self, peer: &Peer, source: &S, attempt: &mut Attempt) -> Result<()> {
        let digest = attempt.digest();
        let probe = attempt.probe;

        if probe.needs_record() {
            self.store.ensure_directory(&digest).await?;
        }

        let written = &attempt.written;
        let record = attempt.record.as_ref();
        let peer_timestamp = attempt.timestamp.as_ref();

        let own_receipt = async {
            if !probe.needs_record() {
                return Ok(());
            }
            self.write_receipt(&digest, written).await
        };
        let peer_timestamp = async {
            match peer_timestamp {
                Some(document) => written
                    .write_if_absent(
                        self.store.timestamp_path(&digest, &peer.public_key),
                        &canonicalize(document),
                    )
                    .await
                    .map(|_| ()),
                None => Ok(()),
            }
        };
        let record_body = async {
            match record {
                Some(record) if probe.needs_record() => {
                    written
                        .write_if_absent(self.store.record_path(&digest), &canonicalize(record))
                        .await
                }
                _ => Ok(false),
            }
        };
        let attachments = async {
            match record {
                Some(record) if probe.needs_record() => {
                    self.fetch_attachments(source, &digest, record, written).await
                }
                _ => Ok(()),
            }
        };

        let (own_receipt, peer_timestamp, record_body, attachments) =
            tokio::join!(own_receipt, peer_timestamp, record_body, attachments);
        own_receipt?;
        peer_timestamp?;
        attempt.created_record = record_body?;
        attachments?;

        debug!(
            accession = attempt.accession.number,
            digest = %digest,
            files = written.len(),
            "Persisted"
        );
        Ok(())
    }

    // =========================================================================
    // Persistence helpers
    // =========================================================================

    async fn write_receipt(&self, digest: &Digest, written: &WrittenFiles) -> Result<()> {
        let version = self
            .schemas
            .latest(SchemaKind::Timestamp)
            .map(|v| v.to_string())
            .ok_or_else(|| ReplicationError::Internal("no timestamp schema loaded".into()))?;
        let receipt = self.identity.receipt(digest, &now_iso8601(), &version)?;
        let path = self
            .store
            .timestamp_path(digest, &self.identity.public_key());
        written
            .write_if_absent(path, &canonicalize(&receipt.to_value()?))
            .await?;
        Ok(())
    }

    /// Download every attachment the record lists, bounded by a bulkhead.
    ///
    /// Every started download runs to completion before the first error is
    /// returned, so all created files are tracked for rollback.
    async fn fetch_attachments<S: PeerSource>(
        &self,
        source: &S,
        digest: &Digest,
        record: &Value,
        written: &WrittenFiles,
    ) -> Result<()> {
        let attachments = attachment_digests(record)?;
        if attachments.is_empty() {
            return Ok(());
        }

        let bulkhead = Bulkhead::new(self.max_concurrent_attachments);
        let results = futures::future::join_all(attachments.iter().map(|attachment| {
            let bulkhead = &bulkhead;
            async move {
                let _slot = bulkhead.acquire().await?;
                self.fetch_attachment(source, digest, attachment, written).await
            }
        }))
        .await;

        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn fetch_attachment<S: PeerSource>(
        &self,
        source: &S,
        digest: &Digest,
        attachment: &Digest,
        written: &WrittenFiles,
    ) -> Result<()> {
        let path = self.store.attachment_path(digest, attachment);
        if self.store.exists(&path).await? {
            trace!(attachment = %attachment, "Attachment already stored");
            return Ok(());
        }

        let body = source.fetch_attachment(*digest, *attachment).await?;

        let Some(mut file) = create_new(&path).await? else {
            return Ok(());
        };
        written.record(path.clone());

        let mut hasher = DigestWriter::new();
        let mut size: u64 = 0;
        let mut stream = body.body;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                ReplicationError::transport_msg(source.label(), "fetch_attachment", e.to_string())
            })?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| ReplicationError::storage(&path, e))?;
        }
        file.flush()
            .await
            .map_err(|e| ReplicationError::storage(&path, e))?;
        drop(file);

        let actual = hasher.finish();
        if actual != *attachment {
            warn!(attachment = %attachment, actual = %actual, "Attachment bytes do not match digest");
            return Err(ReplicationError::integrity(
                format!("attachment of {}", digest),
                attachment,
                actual,
            ));
        }

        written
            .write_if_absent(
                self.store.attachment_type_path(digest, attachment),
                body.content_type.as_bytes(),
            )
            .await?;

        metrics::record_attachment_bytes(size);
        debug!(attachment = %attachment, bytes = size, content_type = %body.content_type, "Stored attachment");
        Ok(())
    }
}
