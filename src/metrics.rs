//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Accession outcomes (synced, already present, failed)
//! - Rollbacks after failed attempts
//! - Attachment volume
//! - Per-peer cursors
//! - Cycle duration and peer request latency
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an accession that stored a new record.
pub fn record_accession_synced(peer: &str) {
    counter!("replication_accessions_synced_total", "peer" => peer.to_string()).increment(1);
}

/// Record an accession whose record was already present.
pub fn record_accession_skipped(peer: &str) {
    counter!("replication_accessions_skipped_total", "peer" => peer.to_string()).increment(1);
}

/// Record a failed accession by error kind.
pub fn record_accession_failed(peer: &str, kind: &str) {
    counter!(
        "replication_accessions_failed_total",
        "peer" => peer.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a rollback and how many files it removed.
pub fn record_rollback(removed: usize, failed: usize) {
    counter!("replication_rollbacks_total").increment(1);
    counter!("replication_rollback_files_removed_total").increment(removed as u64);
    if failed > 0 {
        counter!("replication_rollback_files_failed_total").increment(failed as u64);
    }
}

/// Record attachment bytes written to the store.
pub fn record_attachment_bytes(bytes: u64) {
    counter!("replication_attachment_bytes_total").increment(bytes);
}

/// Set the cursor gauge for a peer.
pub fn set_peer_cursor(peer: &str, last: u64) {
    gauge!("replication_peer_cursor", "peer" => peer.to_string()).set(last as f64);
}

/// Record a finished cycle.
pub fn record_cycle(peers: usize, failed_peers: usize, duration: Duration) {
    counter!("replication_cycles_total").increment(1);
    gauge!("replication_cycle_peers").set(peers as f64);
    if failed_peers > 0 {
        counter!("replication_cycle_peer_failures_total").increment(failed_peers as u64);
    }
    histogram!("replication_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record latency of one peer request by operation type.
pub fn record_peer_request_latency(peer: &str, operation: &str, duration: Duration) {
    histogram!(
        "replication_peer_request_duration_seconds",
        "peer" => peer.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a record published locally.
pub fn record_publish(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_publish_total", "status" => status).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Idle" => 1.0,
        "Replicating" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}
