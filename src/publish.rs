//! Local publication.
//!
//! [`Publisher::publish`] stores a record that originates on this server.
//! It runs the same validate-and-store steps as replication, minus the peer:
//! there is no peer timestamp, and attachments come from the caller instead
//! of a download.

use crate::crypto::{canonicalize, Digest};
use crate::error::{ReplicationError, Result};
use crate::identity::Identity;
use crate::metrics;
use crate::record::{attachment_digests, now_iso8601};
use crate::schema::{SchemaKind, Schemas};
use crate::store::{ContentStore, WrittenFiles};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// An attachment supplied with a new record.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub content_type: String,
    pub data: Bytes,
}

impl NewAttachment {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.data)
    }
}

/// Stores locally originated records.
#[derive(Debug, Clone)]
pub struct Publisher {
    store: ContentStore,
    schemas: Arc<Schemas>,
    identity: Arc<Identity>,
}

impl Publisher {
    pub fn new(store: ContentStore, schemas: Arc<Schemas>, identity: Arc<Identity>) -> Self {
        Self {
            store,
            schemas,
            identity,
        }
    }

    /// The identity that countersigns published records.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Validate and store `record`, returning its digest.
    ///
    /// Every attachment the record lists must be supplied; extra ones are
    /// ignored. Publishing a record that is already stored writes nothing.
    pub async fn publish(&self, record: Value, attachments: Vec<NewAttachment>) -> Result<Digest> {
        let result = self.store_record(record, attachments).await;
        metrics::record_publish(result.is_ok());
        result
    }

    async fn store_record(&self, record: Value, attachments: Vec<NewAttachment>) -> Result<Digest> {
        self.schemas.check(SchemaKind::Publication, &record)?;
        let digest = Digest::of_document(&record);

        let supplied: HashMap<Digest, NewAttachment> = attachments
            .into_iter()
            .map(|attachment| (attachment.digest(), attachment))
            .collect();
        let mut listed = Vec::new();
        for attachment in attachment_digests(&record)? {
            let supplied = supplied.get(&attachment).ok_or_else(|| {
                ReplicationError::integrity(
                    "published attachment",
                    attachment,
                    "no supplied attachment with that digest",
                )
            })?;
            listed.push((attachment, supplied));
        }

        let _exclusive = self.store.lock_digest(&digest).await;
        if self.store.has_record(&digest).await? {
            info!(digest = %digest, "Record already published");
            return Ok(digest);
        }

        self.store.ensure_directory(&digest).await?;

        let written = WrittenFiles::new();
        match self.persist(&digest, &record, &listed, &written).await {
            Ok(()) => {
                info!(digest = %digest, attachments = listed.len(), "Published record");
                Ok(digest)
            }
            Err(e) => {
                let summary = written.rollback().await;
                metrics::record_rollback(summary.removed, summary.failed);
                error!(digest = %digest, error = %e, removed = summary.removed, "Publish failed, rolled back");
                Err(e)
            }
        }
    }

    async fn persist(
        &self,
        digest: &Digest,
        record: &Value,
        attachments: &[(Digest, &NewAttachment)],
        written: &WrittenFiles,
    ) -> Result<()> {
        let version = self
            .schemas
            .latest(SchemaKind::Timestamp)
            .map(|v| v.to_string())
            .ok_or_else(|| ReplicationError::Internal("no timestamp schema loaded".into()))?;
        let receipt = self.identity.receipt(digest, &now_iso8601(), &version)?;
        let receipt_bytes = canonicalize(&receipt.to_value()?);
        let record_bytes = canonicalize(record);

        let own_receipt = written.write_if_absent(
            self.store.timestamp_path(digest, &self.identity.public_key()),
            &receipt_bytes,
        );
        let record_body = written.write_if_absent(self.store.record_path(digest), &record_bytes);
        let files = futures::future::join_all(attachments.iter().map(|(attachment, supplied)| async move {
            let (body, content_type) = tokio::join!(
                written.write_if_absent(self.store.attachment_path(digest, attachment), &supplied.data),
                written.write_if_absent(
                    self.store.attachment_type_path(digest, attachment),
                    supplied.content_type.as_bytes(),
                ),
            );
            body?;
            content_type?;
            metrics::record_attachment_bytes(supplied.data.len() as u64);
            Ok::<(), ReplicationError>(())
        }));

        let (own_receipt, record_body, files) = tokio::join!(own_receipt, record_body, files);
        own_receipt?;
        let created = record_body?;
        files.into_iter().collect::<Result<Vec<()>>>()?;

        if created {
            self.store.append_accession(&now_iso8601(), digest).await?;
        }
        Ok(())
    }
}
