//! In-memory peers for driving the replication pipeline without HTTP.
//!
//! A [`MockPeer`] publishes records the way a real server would: it keeps
//! the record, a timestamp signed with its own key, the attachment bodies,
//! and one accession line per record. Failure switches make it misbehave
//! in the ways a real peer can.
//!
//! [`MockNetwork`] routes registry entries to mock peers by endpoint.

use bytes::Bytes;
use chronicle_replication::crypto::{Digest, Keypair, PublicKey};
use chronicle_replication::error::{ReplicationError, Result};
use chronicle_replication::peer::{AttachmentBody, BoxFuture, ByteStream, PeerConnector, PeerSource};
use chronicle_replication::record::now_iso8601;
use chronicle_replication::{Identity, Peer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

/// Ways a mock peer can misbehave.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Answer timestamp requests with this HTTP status.
    pub timestamp_status: Option<u16>,
    /// Answer attachment requests with this HTTP status.
    pub attachment_status: Option<u16>,
    /// Serve attachment bodies that do not match their digest.
    pub corrupt_attachments: bool,
    /// Sign served timestamps with a key the registry does not know.
    pub forge_signatures: bool,
    /// Never answer the accession feed request.
    pub hang_feed: bool,
    /// Never answer record requests.
    pub hang_records: bool,
    /// Panic while serving a record request.
    pub panic_records: bool,
    /// Break the feed body after this many lines.
    pub feed_breaks_after: Option<usize>,
}

#[derive(Default)]
struct State {
    feed: Vec<String>,
    records: HashMap<Digest, Value>,
    attachments: HashMap<Digest, (String, Bytes)>,
    times: HashMap<Digest, String>,
    faults: Faults,
}

/// A peer server held in memory.
#[derive(Clone)]
pub struct MockPeer {
    host: String,
    label: String,
    keypair: Arc<Keypair>,
    state: Arc<Mutex<State>>,
    record_requests: Arc<AtomicUsize>,
}

impl MockPeer {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            label: host.to_string(),
            keypair: Arc::new(Keypair::generate()),
            state: Arc::new(Mutex::new(State::default())),
            record_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn endpoint(&self) -> Url {
        Url::parse(&format!("https://{}/", self.host)).unwrap()
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// The registry line for this peer with cursor `last`.
    pub fn registry_entry(&self, last: u64) -> Peer {
        Peer::new(self.endpoint(), self.public_key(), last)
    }

    /// Store `record` with its attachments and append it to the feed.
    pub fn publish(&self, record: Value, attachments: &[(&str, &[u8])]) -> Digest {
        let digest = Digest::of_document(&record);
        let mut state = self.state.lock().unwrap();
        for (content_type, data) in attachments {
            state.attachments.insert(
                Digest::of(data),
                (content_type.to_string(), Bytes::copy_from_slice(data)),
            );
        }
        let time = now_iso8601();
        state.feed.push(format!("{},{}", time, digest));
        state.times.insert(digest, time);
        state.records.insert(digest, record);
        digest
    }

    /// Append a raw line to the accession feed.
    pub fn push_feed_line(&self, line: &str) {
        self.state.lock().unwrap().feed.push(line.to_string());
    }

    /// Serve `body` for `digest` instead of the published record.
    pub fn tamper_record(&self, digest: Digest, body: Value) {
        self.state.lock().unwrap().records.insert(digest, body);
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().unwrap().faults = faults;
    }

    pub fn clear_faults(&self) {
        self.set_faults(Faults::default());
    }

    pub fn feed_len(&self) -> usize {
        self.state.lock().unwrap().feed.len()
    }

    pub fn record_requests(&self) -> usize {
        self.record_requests.load(Ordering::SeqCst)
    }

    fn faults(&self) -> Faults {
        self.state.lock().unwrap().faults.clone()
    }

    fn status(&self, operation: &str, status: u16) -> ReplicationError {
        ReplicationError::HttpStatus {
            peer: self.label.clone(),
            operation: operation.to_string(),
            status,
        }
    }

    fn signed_timestamp(&self, digest: Digest) -> Result<Value> {
        let (time, forged) = {
            let state = self.state.lock().unwrap();
            let time = state
                .times
                .get(&digest)
                .cloned()
                .ok_or_else(|| self.status("timestamp", 404))?;
            (time, state.faults.forge_signatures)
        };
        let keypair = if forged {
            Keypair::generate()
        } else {
            Keypair::from_hex(&self.keypair.secret_hex())?
        };
        Identity::new(keypair, self.host.clone())
            .receipt(&digest, &time, "1.0.0")?
            .to_value()
    }
}

impl PeerSource for MockPeer {
    fn label(&self) -> &str {
        &self.label
    }

    fn accessions(&self, from: u64) -> BoxFuture<'_, ByteStream> {
        Box::pin(async move {
            let faults = self.faults();
            if faults.hang_feed {
                return std::future::pending().await;
            }

            let lines: Vec<String> = {
                let state = self.state.lock().unwrap();
                state
                    .feed
                    .iter()
                    .skip(from.saturating_sub(1) as usize)
                    .cloned()
                    .collect()
            };

            let mut chunks: Vec<std::io::Result<Bytes>> = Vec::new();
            for (i, line) in lines.into_iter().enumerate() {
                if faults.feed_breaks_after == Some(i) {
                    chunks.push(Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset",
                    )));
                    break;
                }
                chunks.push(Ok(Bytes::from(format!("{}\n", line))));
            }
            let body: ByteStream = Box::pin(futures::stream::iter(chunks));
            Ok(body)
        })
    }

    fn fetch_record(&self, digest: Digest) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            self.record_requests.fetch_add(1, Ordering::SeqCst);
            let faults = self.faults();
            if faults.panic_records {
                panic!("mock peer {} crashed", self.label);
            }
            if faults.hang_records {
                return std::future::pending().await;
            }
            let record = self.state.lock().unwrap().records.get(&digest).cloned();
            record.ok_or_else(|| self.status("record", 404))
        })
    }

    fn fetch_timestamp(&self, digest: Digest, signer: PublicKey) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            if let Some(status) = self.faults().timestamp_status {
                return Err(self.status("timestamp", status));
            }
            if signer != self.public_key() {
                return Err(self.status("timestamp", 404));
            }
            self.signed_timestamp(digest)
        })
    }

    fn fetch_attachment(&self, _digest: Digest, attachment: Digest) -> BoxFuture<'_, AttachmentBody> {
        Box::pin(async move {
            let faults = self.faults();
            if let Some(status) = faults.attachment_status {
                return Err(self.status("attachment", status));
            }
            let (content_type, data) = self
                .state
                .lock()
                .unwrap()
                .attachments
                .get(&attachment)
                .cloned()
                .ok_or_else(|| self.status("attachment", 404))?;
            let data = if faults.corrupt_attachments {
                let mut bytes = data.to_vec();
                bytes.push(0xFF);
                Bytes::from(bytes)
            } else {
                data
            };

            // Two chunks so hashing spans a chunk boundary.
            let split = data.len() / 2;
            let chunks = vec![Ok(data.slice(..split)), Ok(data.slice(split..))];
            Ok(AttachmentBody {
                content_type,
                body: Box::pin(futures::stream::iter(chunks)),
            })
        })
    }
}

/// Routes registry entries to mock peers by endpoint.
#[derive(Default)]
pub struct MockNetwork {
    peers: Mutex<HashMap<String, MockPeer>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: &MockPeer) {
        self.peers
            .lock()
            .unwrap()
            .insert(peer.endpoint().to_string(), peer.clone());
    }
}

impl PeerConnector for MockNetwork {
    type Source = MockPeer;

    fn connect(&self, peer: &Peer) -> Result<MockPeer> {
        self.peers
            .lock()
            .unwrap()
            .get(peer.endpoint.as_str())
            .cloned()
            .ok_or_else(|| {
                ReplicationError::transport_msg(peer.label(), "connect", "no route to host")
            })
    }
}

/// A minimal valid publication record.
pub fn sample_record(title: &str) -> Value {
    record_with_attachments(title, &[])
}

/// A valid publication record listing `attachments`.
pub fn record_with_attachments(title: &str, attachments: &[Digest]) -> Value {
    let attachments: Vec<String> = attachments.iter().map(|d| d.to_string()).collect();
    json!({
        "version": "1.0.0",
        "title": title,
        "finding": format!("Finding for {}", title),
        "attachments": attachments,
    })
}
