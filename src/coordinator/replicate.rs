// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer replication run.
//!
//! Each peer gets one task per cycle that:
//! 1. Opens the peer's accession feed at `last + 1`
//! 2. Pulls one accession at a time and hands it to the synchronizer
//! 3. Stops at the first failure, leaving the cursor at the last commit
//!
//! # Graceful Shutdown
//!
//! The shutdown signal is checked between accessions and raced against
//! feed reads (`tokio::select!`), never against a synchronizer call: an
//! accession that started persisting always finishes or rolls back.

use super::types::PeerOutcome;
use crate::error::ReplicationError;
use crate::peer::PeerSource;
use crate::registry::Peer;
use crate::stream::AccessionStream;
use crate::synchronizer::{SyncOutcome, Synchronizer};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Replicate everything `source` has beyond `peer.last`.
///
/// Never fails: the error that stopped the run, if any, is in the outcome.
pub async fn run_peer<S: PeerSource>(
    peer: Peer,
    source: S,
    synchronizer: Synchronizer,
    mut shutdown_rx: watch::Receiver<bool>,
) -> PeerOutcome {
    let span = info_span!("replicate", peer = %peer.label());

    async move {
        let mut outcome = PeerOutcome::new(peer);
        let from = outcome.peer.last.saturating_add(1);
        debug!(from, "Opening accession feed");

        let body = tokio::select! {
            body = source.accessions(from) => body,
            _ = shutdown_requested(&mut shutdown_rx) => Err(ReplicationError::Shutdown),
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Could not open accession feed");
                outcome.error = Some(e);
                return outcome;
            }
        };

        let mut stream = AccessionStream::new(source.label(), body, outcome.peer.last);

        loop {
            if *shutdown_rx.borrow() {
                debug!(last = outcome.peer.last, "Shutdown requested, stopping peer run");
                outcome.error = Some(ReplicationError::Shutdown);
                break;
            }

            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown_requested(&mut shutdown_rx) => Err(ReplicationError::Shutdown),
            };
            let accession = match next {
                Ok(Some(accession)) => accession,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "Accession feed ended with error");
                    outcome.error = Some(e);
                    break;
                }
            };

            match synchronizer.sync(&mut outcome.peer, &source, accession).await {
                Ok(SyncOutcome::Stored) => outcome.stored += 1,
                Ok(SyncOutcome::Countersigned | SyncOutcome::AlreadyPresent) => outcome.skipped += 1,
                Err(e) => {
                    // Logged by the synchronizer; the rest waits for next cycle.
                    outcome.error = Some(e);
                    break;
                }
            }
        }

        info!(
            from = outcome.started_at,
            last = outcome.peer.last,
            advanced = outcome.advanced(),
            stored = outcome.stored,
            skipped = outcome.skipped,
            ok = outcome.is_ok(),
            "Peer run finished"
        );
        outcome
    }
    .instrument(span)
    .await
}

/// Resolves once shutdown is signalled. Pends forever if the engine is gone.
pub(crate) async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
