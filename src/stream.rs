// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Accession feed reader.
//!
//! A peer serves its accession log as CSV, one line per accession:
//!
//! ```text
//! 2017-06-01T00:00:00.000Z,3b6a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b59da29
//! ```
//!
//! The second field is the record digest. The feed does not carry accession
//! numbers, so [`AccessionStream`] numbers lines itself, starting at
//! `cursor + 1`. Blank lines are skipped and do not consume a number.
//!
//! # Back-pressure
//!
//! The reader is pull-based: [`AccessionStream::next`] reads from the body
//! only when called, so it never gets ahead of the synchronizer.
//!
//! # Failure
//!
//! A transport error mid-body is a transport error. A line that is not UTF-8,
//! longer than [`MAX_LINE_BYTES`], or lacks a valid digest is a parse error.
//! The caller stops reading; the rest of the feed is fetched again from the
//! committed cursor on the next cycle.

use crate::crypto::Digest;
use crate::error::{ReplicationError, Result};
use crate::peer::ByteStream;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::trace;

/// One entry of a peer's accession feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accession {
    /// Position in the peer's log, reconstructed client-side.
    pub number: u64,
    /// Digest of the accessioned record.
    pub digest: Digest,
}

/// Longest feed line accepted, line terminator included.
pub const MAX_LINE_BYTES: usize = 1024;

/// Parse the digest out of one feed line.
pub fn parse_accession_line(line: &str) -> Result<Digest> {
    let mut fields = line.trim().split(',');
    let _time = fields.next();
    let digest = fields.next().ok_or_else(|| {
        ReplicationError::Parse(format!("accession line has no digest field: {:?}", line))
    })?;
    digest.trim().parse()
}

/// Lazy, ordered reader over one peer's accession feed.
pub struct AccessionStream {
    peer: String,
    reader: StreamReader<ByteStream, Bytes>,
    next_number: u64,
    finished: bool,
}

impl AccessionStream {
    /// Wrap a feed body requested with `from = cursor + 1`.
    pub fn new(peer: impl Into<String>, body: ByteStream, cursor: u64) -> Self {
        Self {
            peer: peer.into(),
            reader: StreamReader::new(body),
            next_number: cursor.saturating_add(1),
            finished: false,
        }
    }

    /// Read the next accession. `Ok(None)` at end of feed.
    ///
    /// After an error the stream stays finished.
    pub async fn next(&mut self) -> Result<Option<Accession>> {
        while !self.finished {
            let line = match self.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let digest = match parse_accession_line(&line) {
                Ok(digest) => digest,
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };

            let accession = Accession {
                number: self.next_number,
                digest,
            };
            self.next_number += 1;
            trace!(peer = %self.peer, accession = accession.number, digest = %digest, "Read accession");
            return Ok(Some(accession));
        }
        Ok(None)
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| ReplicationError::transport_msg(&self.peer, "accessions", e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        if buf.len() >= MAX_LINE_BYTES && !buf.ends_with(b"\n") {
            return Err(ReplicationError::Parse(format!(
                "accession line from {} exceeds {} bytes",
                self.peer, MAX_LINE_BYTES
            )));
        }
        String::from_utf8(buf).map(Some).map_err(|e| {
            ReplicationError::Parse(format!("accession line from {}: {}", self.peer, e))
        })
    }
}

impl std::fmt::Debug for AccessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessionStream")
            .field("peer", &self.peer)
            .field("next_number", &self.next_number)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
