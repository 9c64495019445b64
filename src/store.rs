// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content-addressed storage for records, timestamps and attachments.
//!
//! # Layout
//!
//! ```text
//! {root}/peers                                      peer registry
//! {root}/accessions                                 local accession log
//! {root}/publications/{digest}/publication.json     canonical record
//! {root}/publications/{digest}/timestamps/{key}.json
//! {root}/publications/{digest}/attachments/{attachment}
//! {root}/publications/{digest}/attachments/{attachment}.type
//! ```
//!
//! # Write Semantics
//!
//! Files are only ever created, never rewritten. [`write_if_absent`] writes
//! a private temp file and hard-links it into place; the link fails with
//! `AlreadyExists` if another writer got there first, which counts as
//! success. Concurrent writers racing to store the same digest (two peers
//! delivering the same record, or a peer racing a local publish) converge
//! with no lock, and readers never see a half-written document.
//!
//! Attachments are streamed straight into a `create_new` file instead; only
//! their existence is ever probed while a write may be in flight.
//!
//! Each replication attempt tracks the files it created in a
//! [`WrittenFiles`] so a failed attempt can remove exactly those files and
//! nothing another writer put there.
//!
//! Whole attempts on one digest are serialized with
//! [`ContentStore::lock_digest`]. Without it, an attempt that finds the
//! record already on disk could report success while the attempt that wrote
//! it is still fetching attachments and may yet roll the record back.

use crate::crypto::{Digest, PublicKey};
use crate::error::{ReplicationError, Result};
use crate::record::SignedTimestamp;
use dashmap::DashMap;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

const PUBLICATIONS_DIR: &str = "publications";
const RECORD_FILE: &str = "publication.json";
const TIMESTAMPS_DIR: &str = "timestamps";
const ATTACHMENTS_DIR: &str = "attachments";
const ACCESSIONS_FILE: &str = "accessions";

/// Filesystem store rooted at the configured data directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    locks: Arc<DigestLocks>,
}

impl ContentStore {
    /// Clones share one set of digest locks; separate `new` calls do not.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(DigestLocks::default()),
        }
    }

    /// Wait for exclusive use of `digest` among clones of this store.
    ///
    /// Held for a whole store-or-countersign attempt, rollback included.
    pub async fn lock_digest(&self, digest: &Digest) -> DigestGuard {
        let mutex = Arc::clone(self.locks.0.entry(*digest).or_default().value());
        let guard = mutex.lock_owned().await;
        DigestGuard {
            locks: Arc::clone(&self.locks),
            digest: *digest,
            guard: Some(guard),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Path derivation (pure)
    // =========================================================================

    pub fn record_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join(PUBLICATIONS_DIR).join(digest.to_string())
    }

    pub fn record_path(&self, digest: &Digest) -> PathBuf {
        self.record_dir(digest).join(RECORD_FILE)
    }

    pub fn timestamp_path(&self, digest: &Digest, signer: &PublicKey) -> PathBuf {
        self.record_dir(digest)
            .join(TIMESTAMPS_DIR)
            .join(format!("{}.json", signer))
    }

    pub fn attachment_path(&self, digest: &Digest, attachment: &Digest) -> PathBuf {
        self.record_dir(digest)
            .join(ATTACHMENTS_DIR)
            .join(attachment.to_string())
    }

    pub fn attachment_type_path(&self, digest: &Digest, attachment: &Digest) -> PathBuf {
        self.record_dir(digest)
            .join(ATTACHMENTS_DIR)
            .join(format!("{}.type", attachment))
    }

    pub fn accessions_path(&self) -> PathBuf {
        self.root.join(ACCESSIONS_FILE)
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Create the directory tree for `digest`. Idempotent.
    pub async fn ensure_directory(&self, digest: &Digest) -> Result<()> {
        for dir in [TIMESTAMPS_DIR, ATTACHMENTS_DIR] {
            let path = self.record_dir(digest).join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| ReplicationError::storage(&path, e))?;
        }
        Ok(())
    }

    /// Whether `path` exists.
    pub async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path)
            .await
            .map_err(|e| ReplicationError::storage(path, e))
    }

    pub async fn has_record(&self, digest: &Digest) -> Result<bool> {
        self.exists(&self.record_path(digest)).await
    }

    pub async fn has_timestamp(&self, digest: &Digest, signer: &PublicKey) -> Result<bool> {
        self.exists(&self.timestamp_path(digest, signer)).await
    }

    /// Read and parse a stored record.
    pub async fn read_record(&self, digest: &Digest) -> Result<Value> {
        read_json(&self.record_path(digest)).await
    }

    /// Read the timestamp `signer` issued for `digest`.
    pub async fn read_timestamp(&self, digest: &Digest, signer: &PublicKey) -> Result<SignedTimestamp> {
        let value = read_json(&self.timestamp_path(digest, signer)).await?;
        SignedTimestamp::from_value(&value)
    }

    /// Every stored timestamp for `digest`, keyed by signer.
    pub async fn list_timestamps(&self, digest: &Digest) -> Result<Vec<(PublicKey, SignedTimestamp)>> {
        let dir = self.record_dir(digest).join(TIMESTAMPS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ReplicationError::storage(&dir, e)),
        };

        let mut timestamps = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ReplicationError::storage(&dir, e))?
        {
            let name = entry.file_name();
            let Some(signer) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<PublicKey>().ok())
            else {
                debug!(file = ?name, "Skipping non-timestamp file");
                continue;
            };
            let value = read_json(&entry.path()).await?;
            timestamps.push((signer, SignedTimestamp::from_value(&value)?));
        }
        timestamps.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        Ok(timestamps)
    }

    /// Append one `time,digest` line to the accession log.
    pub async fn append_accession(&self, time: &str, digest: &Digest) -> Result<()> {
        let path = self.accessions_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ReplicationError::storage(&path, e))?;
        file.write_all(format!("{},{}\n", time, digest).as_bytes())
            .await
            .map_err(|e| ReplicationError::storage(&path, e))?;
        file.flush()
            .await
            .map_err(|e| ReplicationError::storage(&path, e))
    }

    /// Read the accession log as `(time, digest)` pairs, oldest first.
    pub async fn read_accessions(&self) -> Result<Vec<(String, Digest)>> {
        let path = self.accessions_path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ReplicationError::storage(&path, e)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let (time, digest) = line.split_once(',').ok_or_else(|| {
                    ReplicationError::Parse(format!("malformed accession log line: {}", line))
                })?;
                Ok((time.to_string(), digest.parse()?))
            })
            .collect()
    }
}

/// Exclusive create with complete content. Returns `true` if this call
/// created the file, `false` if something was already there (left untouched).
pub async fn write_if_absent(path: &Path, bytes: &[u8]) -> Result<bool> {
    let tmp = temp_path(path);
    if let Err(e) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(ReplicationError::storage(&tmp, e));
    }

    let linked = fs::hard_link(&tmp, path).await;
    if let Err(e) = fs::remove_file(&tmp).await {
        warn!(file = %tmp.display(), error = %e, "Failed to remove temp file");
    }
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(ReplicationError::storage(path, e)),
    }
}

/// Sibling temp name, unique per process and call.
fn temp_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}-{}.tmp", name, std::process::id(), n))
}

/// Open `path` for writing only if it does not exist yet.
pub async fn create_new(path: &Path) -> Result<Option<fs::File>> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(ReplicationError::storage(path, e)),
    }
}

async fn read_json(path: &Path) -> Result<Value> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| ReplicationError::storage(path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ReplicationError::Parse(format!("{}: {}", path.display(), e)))
}

#[derive(Debug, Default)]
struct DigestLocks(DashMap<Digest, Arc<AsyncMutex<()>>>);

/// Exclusive use of one digest, released on drop.
#[derive(Debug)]
pub struct DigestGuard {
    locks: Arc<DigestLocks>,
    digest: Digest,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DigestGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still holds the mutex: nobody is waiting on it.
        self.locks
            .0
            .remove_if(&self.digest, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Files created by one attempt, for rollback.
///
/// Shared by the concurrent writers of a stage; each registers a path the
/// moment it creates the file, before writing content.
#[derive(Debug, Default)]
pub struct WrittenFiles {
    paths: Mutex<Vec<PathBuf>>,
}

impl WrittenFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: PathBuf) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.push(path);
        }
    }

    /// [`write_if_absent`] `path` and remember it if this call created it.
    pub async fn write_if_absent(&self, path: PathBuf, bytes: &[u8]) -> Result<bool> {
        let created = write_if_absent(&path, bytes).await?;
        if created {
            self.record(path);
        }
        Ok(created)
    }

    pub fn len(&self) -> usize {
        self.paths.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every recorded file. Best effort: failures are logged and
    /// counted, never returned.
    pub async fn rollback(&self) -> RollbackSummary {
        let paths = match self.paths.lock() {
            Ok(mut paths) => std::mem::take(&mut *paths),
            Err(_) => Vec::new(),
        };

        let results = futures::future::join_all(paths.iter().map(|path| async move {
            match fs::remove_file(path).await {
                Ok(()) => {
                    debug!(file = %path.display(), "Unlinked");
                    true
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to unlink during rollback");
                    false
                }
            }
        }))
        .await;

        let removed = results.iter().filter(|ok| **ok).count();
        RollbackSummary {
            removed,
            failed: results.len() - removed,
        }
    }
}

/// Outcome of [`WrittenFiles::rollback`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub removed: usize,
    pub failed: usize,
}
