// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end replication cycles against in-memory peers.
//!
//! Run with: cargo test --test replication

mod common;

use chronicle_replication::publish::NewAttachment;
use chronicle_replication::{crypto::Digest, ReplicationError};
use common::*;
use tempfile::tempdir;

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn stores_new_records_and_advances_cursor() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let d1 = peer.publish(sample_record("first"), &[]);
    let d2 = peer.publish(sample_record("second"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.stored(), 2);
    assert_eq!(report.failed_peers(), 0);
    assert_eq!(cursor(&engine, &peer).await, 2);

    let store = engine.store();
    for digest in [d1, d2] {
        assert!(store.has_record(&digest).await.unwrap());
        assert!(store.has_timestamp(&digest, &peer.public_key()).await.unwrap());
        assert!(store.has_timestamp(&digest, &own_key(&engine)).await.unwrap());

        let stored = store.read_record(&digest).await.unwrap();
        assert_eq!(Digest::of_document(&stored), digest);
    }

    let log = store.read_accessions().await.unwrap();
    let logged: Vec<Digest> = log.into_iter().map(|(_, d)| d).collect();
    assert_eq!(logged, vec![d1, d2]);
}

#[tokio::test]
async fn stored_timestamps_verify_under_their_signers() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(sample_record("signed"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;
    engine.run_cycle().await.unwrap();

    let timestamps = engine.store().list_timestamps(&digest).await.unwrap();
    assert_eq!(timestamps.len(), 2);
    for (signer, timestamp) in timestamps {
        assert_eq!(timestamp.digest().unwrap(), digest);
        timestamp.verify(&signer).unwrap();
    }
}

#[tokio::test]
async fn attachments_are_stored_with_content_type() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let png: &[u8] = b"\x89PNG fake image bytes";
    let attachment = Digest::of(png);
    let digest = peer.publish(
        record_with_attachments("with image", &[attachment]),
        &[("image/png", png)],
    );

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.stored(), 1);

    let store = engine.store();
    let body = tokio::fs::read(store.attachment_path(&digest, &attachment))
        .await
        .unwrap();
    assert_eq!(body, png);
    let content_type = tokio::fs::read_to_string(store.attachment_type_path(&digest, &attachment))
        .await
        .unwrap();
    assert_eq!(content_type.trim(), "image/png");
}

#[tokio::test]
async fn already_present_record_advances_without_logging() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    for i in 1..=4 {
        peer.publish(sample_record(&format!("old {}", i)), &[]);
    }
    let d5 = peer.publish(sample_record("new on peer"), &[]);
    let d6 = peer.publish(sample_record("known locally"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);

    let local = engine
        .publisher()
        .publish(sample_record("known locally"), vec![])
        .await
        .unwrap();
    assert_eq!(local, d6);
    register(&engine, &[peer.registry_entry(4)]).await;

    let report = engine.run_cycle().await.unwrap();
    let outcome = report.peer(peer.endpoint().as_str()).unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.stored, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(cursor(&engine, &peer).await, 6);

    // D6 logged once by the local publish, D5 appended by replication.
    let logged: Vec<Digest> = engine
        .store()
        .read_accessions()
        .await
        .unwrap()
        .into_iter()
        .map(|(_, d)| d)
        .collect();
    assert_eq!(logged, vec![d6, d5]);
}

#[tokio::test]
async fn countersigns_locally_known_record() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(sample_record("shared"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    engine
        .publisher()
        .publish(sample_record("shared"), vec![])
        .await
        .unwrap();
    assert!(!engine
        .store()
        .has_timestamp(&digest, &peer.public_key())
        .await
        .unwrap());
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.stored(), 0);
    assert_eq!(report.skipped(), 1);

    let store = engine.store();
    assert!(store.has_timestamp(&digest, &peer.public_key()).await.unwrap());
    assert_eq!(store.read_accessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn replay_is_idempotent() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    peer.publish(sample_record("one"), &[]);
    peer.publish(sample_record("two"), &[]);
    peer.publish(sample_record("three"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let first = engine.run_cycle().await.unwrap();
    assert_eq!(first.stored(), 3);

    // Simulate a crash before the cursor was saved.
    register(&engine, &[peer.registry_entry(0)]).await;
    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.stored(), 0);
    assert_eq!(second.skipped(), 3);
    assert_eq!(cursor(&engine, &peer).await, 3);
    assert_eq!(engine.store().read_accessions().await.unwrap().len(), 3);
}

#[tokio::test]
async fn replay_rechecks_stored_record() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(sample_record("kept"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;
    assert_eq!(engine.run_cycle().await.unwrap().stored(), 1);

    // Valid JSON, valid schema, wrong content.
    let stored = engine.store().record_path(&digest);
    std::fs::write(&stored, serde_json::to_vec(&sample_record("swapped")).unwrap()).unwrap();
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    let error = report.peers[0].error.as_ref().expect("stored record must be rechecked");
    assert_eq!(error.kind(), "integrity", "{}", error);
    assert_eq!(cursor(&engine, &peer).await, 0);
    assert!(stored.exists(), "a failed recheck must not remove the stored record");
}

#[tokio::test]
async fn replay_trusts_stored_record_when_recheck_disabled() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(sample_record("kept"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let mut config = chronicle_replication::ReplicationConfig::for_testing(dir.path());
    config.settings.verification.recheck_known_records = false;
    let engine = engine_with_config(config, network);
    register(&engine, &[peer.registry_entry(0)]).await;
    assert_eq!(engine.run_cycle().await.unwrap().stored(), 1);

    // Unreadable as JSON: any attempt to read it back would fail.
    std::fs::write(engine.store().record_path(&digest), b"not json at all").unwrap();
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    assert!(report.peers[0].is_ok(), "report: {:?}", report);
    assert_eq!(report.skipped(), 1);
    assert_eq!(cursor(&engine, &peer).await, 1);
    assert_eq!(peer.record_requests(), 1, "known record is not fetched again");
}

#[tokio::test]
async fn caught_up_peer_is_not_refetched() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    peer.publish(sample_record("one"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    engine.run_cycle().await.unwrap();
    let requests = peer.record_requests();

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.stored() + report.skipped(), 0);
    assert_eq!(peer.record_requests(), requests);
    assert_eq!(cursor(&engine, &peer).await, 1);
}

#[tokio::test]
async fn published_record_with_attachment_is_replicated_from_us() {
    let dir = tempdir().unwrap();
    let network = MockNetwork::new();
    let engine = engine(dir.path(), network);

    let data: &[u8] = b"%PDF-1.7 report";
    let attachment = NewAttachment::new("application/pdf", data.to_vec());
    let record = record_with_attachments("local", &[attachment.digest()]);
    let digest = engine.publisher().publish(record, vec![attachment]).await.unwrap();

    let store = engine.store();
    assert!(store.has_record(&digest).await.unwrap());
    assert!(store.has_timestamp(&digest, &own_key(&engine)).await.unwrap());
    assert!(store
        .exists(&store.attachment_path(&digest, &Digest::of(data)))
        .await
        .unwrap());
}

// =============================================================================
// Failure Handling
// =============================================================================

#[tokio::test]
async fn timestamp_failure_leaves_cursor_and_store_untouched() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(sample_record("unlucky"), &[]);
    peer.set_faults(Faults {
        timestamp_status: Some(500),
        ..Faults::default()
    });

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    let outcome = report.peer(peer.endpoint().as_str()).unwrap();
    assert!(matches!(
        outcome.error,
        Some(ReplicationError::HttpStatus { status: 500, .. })
    ));
    assert_eq!(cursor(&engine, &peer).await, 0);

    let store = engine.store();
    assert!(!store.has_record(&digest).await.unwrap());
    assert!(!store.has_timestamp(&digest, &own_key(&engine)).await.unwrap());
    assert!(store.read_accessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn attachment_failure_rolls_back_everything() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let data: &[u8] = b"attachment body";
    let attachment = Digest::of(data);
    let digest = peer.publish(
        record_with_attachments("with attachment", &[attachment]),
        &[("text/plain", data)],
    );
    peer.set_faults(Faults {
        attachment_status: Some(503),
        ..Faults::default()
    });

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.failed_peers(), 1);
    assert_eq!(cursor(&engine, &peer).await, 0);

    let store = engine.store();
    assert!(!store.has_record(&digest).await.unwrap());
    assert!(!store.has_timestamp(&digest, &own_key(&engine)).await.unwrap());
    assert!(!store.has_timestamp(&digest, &peer.public_key()).await.unwrap());
    assert!(!store
        .exists(&store.attachment_path(&digest, &attachment))
        .await
        .unwrap());
    assert!(store.read_accessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn attachment_digest_mismatch_rolls_back() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let data: &[u8] = b"original bytes";
    let attachment = Digest::of(data);
    let digest = peer.publish(
        record_with_attachments("corrupt attachment", &[attachment]),
        &[("text/plain", data)],
    );
    peer.set_faults(Faults {
        corrupt_attachments: true,
        ..Faults::default()
    });

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    let outcome = report.peer(peer.endpoint().as_str()).unwrap();
    assert_eq!(outcome.error.as_ref().map(|e| e.kind()), Some("integrity"));

    let store = engine.store();
    assert!(!store.has_record(&digest).await.unwrap());
    assert!(!store
        .exists(&store.attachment_path(&digest, &attachment))
        .await
        .unwrap());
}

#[tokio::test]
async fn record_digest_mismatch_is_never_stored() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(sample_record("honest"), &[]);
    peer.tamper_record(digest, sample_record("tampered"));

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    let outcome = report.peer(peer.endpoint().as_str()).unwrap();
    assert!(matches!(outcome.error, Some(ReplicationError::Integrity { .. })));
    assert_eq!(cursor(&engine, &peer).await, 0);

    let store = engine.store();
    assert!(!store.has_record(&digest).await.unwrap());
    assert!(!store
        .has_record(&Digest::of_document(&sample_record("tampered")))
        .await
        .unwrap());
}

#[tokio::test]
async fn forged_signature_is_never_stored() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(sample_record("forged"), &[]);
    peer.set_faults(Faults {
        forge_signatures: true,
        ..Faults::default()
    });

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    let outcome = report.peer(peer.endpoint().as_str()).unwrap();
    assert!(matches!(outcome.error, Some(ReplicationError::Authenticity(_))));
    assert_eq!(cursor(&engine, &peer).await, 0);
    assert!(!engine.store().has_record(&digest).await.unwrap());
}

#[tokio::test]
async fn invalid_record_fails_schema_check() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let digest = peer.publish(serde_json::json!({ "version": "1.0.0", "title": "" }), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    let outcome = report.peer(peer.endpoint().as_str()).unwrap();
    assert!(matches!(
        outcome.error,
        Some(ReplicationError::SchemaValidation { .. })
    ));
    assert!(!engine.store().has_record(&digest).await.unwrap());
}

#[tokio::test]
async fn cycle_stops_at_first_failure_and_resumes() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    let data: &[u8] = b"second record attachment";
    let d1 = peer.publish(sample_record("first"), &[]);
    let d2 = peer.publish(
        record_with_attachments("second", &[Digest::of(data)]),
        &[("text/plain", data)],
    );
    let d3 = peer.publish(sample_record("third"), &[]);
    peer.set_faults(Faults {
        attachment_status: Some(500),
        ..Faults::default()
    });

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.stored(), 1);
    assert_eq!(cursor(&engine, &peer).await, 1);
    assert!(engine.store().has_record(&d1).await.unwrap());
    assert!(!engine.store().has_record(&d3).await.unwrap());

    peer.clear_faults();
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.stored(), 2);
    assert_eq!(cursor(&engine, &peer).await, 3);
    assert!(engine.store().has_record(&d2).await.unwrap());
    assert!(engine.store().has_record(&d3).await.unwrap());
}

#[tokio::test]
async fn unparsable_feed_line_stops_peer() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    peer.publish(sample_record("good"), &[]);
    peer.push_feed_line("2017-06-01T00:00:00Z,not-a-digest");
    peer.publish(sample_record("after"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);
    register(&engine, &[peer.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    let outcome = report.peer(peer.endpoint().as_str()).unwrap();
    assert_eq!(outcome.stored, 1);
    assert!(!outcome.is_ok());
    assert_eq!(cursor(&engine, &peer).await, 1);
}

// =============================================================================
// Registry
// =============================================================================

#[tokio::test]
async fn empty_registry_is_noop() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path(), MockNetwork::new());

    let report = engine.run_cycle().await.unwrap();
    assert!(report.peers.is_empty());
    assert!(engine.store().read_accessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_registry_lines_are_skipped() {
    let dir = tempdir().unwrap();
    let peer = MockPeer::new("peer-a.example");
    peer.publish(sample_record("one"), &[]);

    let network = MockNetwork::new();
    network.add(&peer);
    let engine = engine(dir.path(), network);

    let text = format!(
        "this is not a peer\n{}\nhttps://b.example/,zz,1\n",
        peer.registry_entry(0).to_line()
    );
    tokio::fs::write(engine.registry().path(), text).await.unwrap();

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.peers.len(), 1);
    assert_eq!(report.stored(), 1);
    assert_eq!(cursor(&engine, &peer).await, 1);
}

#[tokio::test]
async fn unknown_peer_is_reported_not_fatal() {
    let dir = tempdir().unwrap();
    let known = MockPeer::new("known.example");
    known.publish(sample_record("reachable"), &[]);
    let unknown = MockPeer::new("unknown.example");

    let network = MockNetwork::new();
    network.add(&known);
    let engine = engine(dir.path(), network);
    register(&engine, &[unknown.registry_entry(7), known.registry_entry(0)]).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.peers.len(), 2);
    assert_eq!(report.failed_peers(), 1);
    assert_eq!(cursor(&engine, &unknown).await, 7);
    assert_eq!(cursor(&engine, &known).await, 1);
}
