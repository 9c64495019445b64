//! # Chronicle Replication
//!
//! Peer-to-peer replication of a content-addressed, signed publication log.
//!
//! ## Architecture
//!
//! Each server keeps an append-only log of publication records. Records are
//! addressed by the SHA-256 of their canonical JSON form and countersigned
//! by every server that stores them. This crate pulls new records from
//! registered peers and stores them locally:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          chronicle-replication                            │
//! │                                                                           │
//! │  ┌──────────────┐    ┌─────────────────┐    ┌──────────────────────────┐  │
//! │  │ PeerRegistry │───►│ AccessionStream │───►│ Synchronizer             │  │
//! │  │ (peers file) │    │ (per peer task) │    │ probe/fetch/validate/    │  │
//! │  └──────────────┘    └─────────────────┘    │ persist/log/commit       │  │
//! │         ▲                                   └──────────────────────────┘  │
//! │         │ cursors saved after all                        │                │
//! │         │ peer tasks finish                              ▼                │
//! │  ┌──────────────────┐                        ┌─────────────────────────┐  │
//! │  │ ReplicationEngine│                        │ ContentStore            │  │
//! │  │ (cycle driver)   │                        │ publications/{digest}/  │  │
//! │  └──────────────────┘                        └─────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. A stored record always hashes to its address.
//! 2. A stored timestamp always names its record and verifies under its signer.
//! 3. Files are never overwritten; concurrent writers converge.
//! 4. A peer's cursor never goes back and only moves past fully stored accessions.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chronicle_replication::{ReplicationConfig, ReplicationEngine};
//!
//! #[tokio::main]
//! async fn main() -> chronicle_replication::Result<()> {
//!     let config = ReplicationConfig::from_file("chronicle.json")?;
//!     let engine = ReplicationEngine::open(config).await?;
//!
//!     let report = engine.run_cycle().await?;
//!     println!("stored {} new records", report.stored());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod peer;
pub mod publish;
pub mod record;
pub mod registry;
pub mod resilience;
pub mod schema;
pub mod store;
pub mod stream;
pub mod synchronizer;

// Re-exports for convenience
pub use config::{ReplicationConfig, ReplicationSettings};
pub use coordinator::{CycleReport, EngineState, PeerOutcome, ReplicationEngine};
pub use crypto::{Digest, Keypair, PublicKey, Signature};
pub use error::{ReplicationError, Result};
pub use identity::Identity;
pub use peer::{HttpConnector, HttpPeer, PeerConnector, PeerSource};
pub use publish::{NewAttachment, Publisher};
pub use registry::{Peer, PeerRegistry};
pub use schema::{SchemaKind, Schemas};
pub use store::ContentStore;
pub use stream::{Accession, AccessionStream};
pub use synchronizer::{SyncOutcome, Synchronizer};
