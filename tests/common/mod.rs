//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-memory mock peers and a mock network ([`mock_peer`])
//! - Engine and registry setup helpers

#![allow(dead_code)]

pub mod mock_peer;

pub use mock_peer::*;

use chronicle_replication::crypto::Keypair;
use chronicle_replication::{Identity, Peer, ReplicationConfig, ReplicationEngine};
use std::path::Path;

/// An engine over `dir` that reaches peers through `network`.
pub fn engine(dir: &Path, network: MockNetwork) -> ReplicationEngine<MockNetwork> {
    engine_with_config(ReplicationConfig::for_testing(dir), network)
}

pub fn engine_with_config(
    config: ReplicationConfig,
    network: MockNetwork,
) -> ReplicationEngine<MockNetwork> {
    let identity = Identity::new(Keypair::generate(), config.hostname.clone());
    ReplicationEngine::with_connector(config, identity, network).unwrap()
}

/// Write `peers` to the engine's registry file.
pub async fn register(engine: &ReplicationEngine<MockNetwork>, peers: &[Peer]) {
    engine.registry().save(peers).await.unwrap();
}

/// The cursor the registry file holds for `peer`.
pub async fn cursor(engine: &ReplicationEngine<MockNetwork>, peer: &MockPeer) -> u64 {
    engine
        .registry()
        .load()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.endpoint == peer.endpoint())
        .map(|p| p.last)
        .expect("peer missing from registry")
}

/// Our own server's public key.
pub fn own_key(engine: &ReplicationEngine<MockNetwork>) -> chronicle_replication::PublicKey {
    engine.publisher().identity().public_key()
}
