//! Engine state and cycle report types.
//!
//! # State Transitions
//!
//! ```text
//!              run_cycle() / run()
//! Created ─────────────────────────→ Replicating
//!                                      │     ↑
//!                       (cycle ends)   ↓     │ (next cycle)
//!                                     Idle ──┘
//!                                      │
//!                           shutdown() ↓
//!                                 ShuttingDown ──→ Stopped
//!
//! (registry unreadable or unwritable) → Failed
//! ```
//!
//! - **Created**: Initial state after `ReplicationEngine::new()`.
//! - **Replicating**: A cycle is running.
//! - **Idle**: Between cycles.
//! - **ShuttingDown**: `shutdown()` called. Peer runs stop after their
//!   current accession.
//! - **Stopped**: The poll loop has exited.
//! - **Failed**: The last cycle could not load or save the registry.

use crate::error::ReplicationError;
use crate::registry::Peer;
use std::time::Duration;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created, no cycle run yet.
    Created,

    /// Waiting for the next cycle.
    Idle,

    /// A cycle is in progress.
    Replicating,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Stopped. Safe to drop.
    Stopped,

    /// The last cycle hit a registry error.
    ///
    /// `run()` keeps polling; the next successful cycle returns to `Idle`.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Replicating => write!(f, "Replicating"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// How one peer's run ended.
#[derive(Debug)]
pub struct PeerOutcome {
    /// The peer with its cursor after the run.
    pub peer: Peer,
    /// Cursor before the run.
    pub started_at: u64,
    /// Accessions that stored a new record.
    pub stored: u64,
    /// Accessions whose record was already present.
    pub skipped: u64,
    /// Why the run stopped early, if it did.
    pub error: Option<ReplicationError>,
}

impl PeerOutcome {
    pub fn new(peer: Peer) -> Self {
        Self {
            started_at: peer.last,
            peer,
            stored: 0,
            skipped: 0,
            error: None,
        }
    }

    /// Accessions committed in this run.
    pub fn advanced(&self) -> u64 {
        self.peer.last.saturating_sub(self.started_at)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one replication cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// One entry per registry peer, in registry order.
    pub peers: Vec<PeerOutcome>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn stored(&self) -> u64 {
        self.peers.iter().map(|p| p.stored).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.peers.iter().map(|p| p.skipped).sum()
    }

    pub fn failed_peers(&self) -> usize {
        self.peers.iter().filter(|p| !p.is_ok()).count()
    }

    /// The outcome for the peer at `endpoint`.
    pub fn peer(&self, endpoint: &str) -> Option<&PeerOutcome> {
        self.peers.iter().find(|p| p.peer.endpoint.as_str() == endpoint)
    }
}
