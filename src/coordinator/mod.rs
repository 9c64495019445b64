// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The peer registry via [`crate::registry::PeerRegistry`]
//! - Peer transport via [`crate::peer::PeerConnector`]
//! - Per-accession reconciliation via [`crate::synchronizer::Synchronizer`]
//!
//! # Cycle
//!
//! 1. Load the registry (no peers: nothing else happens)
//! 2. Spawn one task per peer; each pulls and reconciles accessions in order
//!    and stops at its first failure
//! 3. Wait for every peer task, then write all cursors back to the registry
//!
//! Peers are isolated: one peer failing, hanging up or panicking only costs
//! that peer's progress. The registry is written by the coordinator alone,
//! after all peer tasks have ended.

mod replicate;
mod types;

pub use types::{CycleReport, EngineState, PeerOutcome};

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::identity::Identity;
use crate::metrics;
use crate::peer::{HttpConnector, PeerConnector};
use crate::publish::Publisher;
use crate::registry::{Peer, PeerRegistry};
use crate::schema::Schemas;
use crate::store::ContentStore;
use crate::synchronizer::Synchronizer;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The main replication engine.
///
/// Pulls new accessions from every registered peer, one cycle at a time.
/// Generic over the transport so tests can run against an in-memory network.
pub struct ReplicationEngine<C: PeerConnector = HttpConnector> {
    /// Configuration
    config: ReplicationConfig,

    /// Where peers and their cursors are kept
    registry: PeerRegistry,

    /// Shared per-accession pipeline (cheap to clone into peer tasks)
    synchronizer: Synchronizer,

    /// Local publish entry point, sharing store, schemas and identity
    publisher: Publisher,

    /// Builds one transport per peer per cycle
    connector: Arc<C>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Serializes cycles: the registry has a single writer
    cycle_lock: Mutex<()>,
}

impl ReplicationEngine<HttpConnector> {
    /// Create an engine that talks HTTP to its peers.
    pub fn new(config: ReplicationConfig, identity: Identity) -> Result<Self> {
        let connector = HttpConnector::new(&config.settings.http)?;
        Self::with_connector(config, identity, connector)
    }

    /// Load the identity named by `config.keypair_path` and create the engine.
    pub async fn open(config: ReplicationConfig) -> Result<Self> {
        let identity = Identity::load(&config.keypair_path, config.hostname.clone()).await?;
        Self::new(config, identity)
    }
}

impl<C: PeerConnector> ReplicationEngine<C> {
    /// Create an engine with a custom transport and the built-in schemas.
    pub fn with_connector(config: ReplicationConfig, identity: Identity, connector: C) -> Result<Self> {
        Self::with_parts(config, identity, Schemas::builtin()?, connector)
    }

    /// Create an engine from explicit parts.
    pub fn with_parts(
        config: ReplicationConfig,
        identity: Identity,
        schemas: Arc<Schemas>,
        connector: C,
    ) -> Result<Self> {
        config.validate()?;

        let store = ContentStore::new(&config.directory);
        let identity = Arc::new(identity);
        let synchronizer = Synchronizer::new(store.clone(), Arc::clone(&schemas), Arc::clone(&identity))
            .with_max_concurrent_attachments(config.settings.attachments.max_concurrent)
            .with_recheck_known_records(config.settings.verification.recheck_known_records);
        let publisher = Publisher::new(store, schemas, identity);

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            registry: PeerRegistry::new(&config.directory),
            config,
            synchronizer,
            publisher,
            connector: Arc::new(connector),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            cycle_lock: Mutex::new(()),
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ContentStore {
        self.synchronizer.store()
    }

    /// Entry point for records that originate on this server.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run one replication cycle over every registered peer.
    ///
    /// Per-peer failures are reported in the [`CycleReport`], not returned.
    /// Errors are reserved for the registry itself and for shutdown.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        if self.is_shutting_down() {
            return Err(ReplicationError::Shutdown);
        }

        let start = Instant::now();
        self.set_state(EngineState::Replicating);

        let peers = match self.registry.load().await {
            Ok(peers) => peers,
            Err(e) => {
                error!(error = %e, "Failed to load peer registry");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        if peers.is_empty() {
            debug!("No peers registered, nothing to replicate");
            self.set_state(EngineState::Idle);
            return Ok(CycleReport::default());
        }

        info!(peers = peers.len(), "Starting replication cycle");
        let outcomes = self.replicate_all(peers).await;

        let cursors: Vec<Peer> = outcomes.iter().map(|o| o.peer.clone()).collect();
        if let Err(e) = self.registry.save(&cursors).await {
            error!(error = %e, "Failed to save peer registry");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let report = CycleReport {
            peers: outcomes,
            duration: start.elapsed(),
        };
        metrics::record_cycle(report.peers.len(), report.failed_peers(), report.duration);
        info!(
            stored = report.stored(),
            skipped = report.skipped(),
            failed_peers = report.failed_peers(),
            duration_ms = report.duration.as_millis() as u64,
            "Replication cycle finished"
        );

        if !self.is_shutting_down() {
            self.set_state(EngineState::Idle);
        }
        Ok(report)
    }

    /// One task per peer; outcomes come back in registry order.
    async fn replicate_all(&self, peers: Vec<Peer>) -> Vec<PeerOutcome> {
        let mut outcomes: Vec<PeerOutcome> = Vec::with_capacity(peers.len());
        let mut tasks = JoinSet::new();

        for (index, peer) in peers.into_iter().enumerate() {
            // Placeholder keeps the cursor if the task never reports back.
            let mut placeholder = PeerOutcome::new(peer.clone());
            let source = match self.connector.connect(&peer) {
                Ok(source) => source,
                Err(e) => {
                    warn!(peer = %peer.label(), error = %e, "Could not connect to peer");
                    placeholder.error = Some(e);
                    outcomes.push(placeholder);
                    continue;
                }
            };
            placeholder.error = Some(ReplicationError::Internal("peer task did not report".into()));
            outcomes.push(placeholder);

            let synchronizer = self.synchronizer.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            tasks.spawn(async move {
                // Inner task so a panic is caught with the peer still known.
                let fallback = peer.clone();
                let run = tokio::spawn(replicate::run_peer(peer, source, synchronizer, shutdown_rx));
                let outcome = match run.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(peer = %fallback.label(), error = %e, "Peer task panicked");
                        let mut outcome = PeerOutcome::new(fallback);
                        outcome.error = Some(ReplicationError::Internal(format!("peer task failed: {}", e)));
                        outcome
                    }
                };
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = outcome,
                Err(e) => error!(error = %e, "Peer wrapper task failed"),
            }
        }

        outcomes
    }

    /// Run cycles every `schedule.interval` until [`shutdown()`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let interval = self.config.settings.schedule.interval_duration();
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(interval_ms = interval.as_millis() as u64, "Replication engine running");

        loop {
            match self.run_cycle().await {
                Ok(_) => {}
                Err(ReplicationError::Shutdown) => break,
                // Already logged; try again next interval.
                Err(e) => debug!(error = %e, "Cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = replicate::shutdown_requested(&mut shutdown_rx) => {}
            }
            if self.is_shutting_down() {
                break;
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
        Ok(())
    }

    /// Ask the engine to stop.
    ///
    /// Running peer tasks finish their current accession first. `run()`
    /// returns once the in-flight cycle has saved the registry.
    pub fn shutdown(&self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
    }
}
