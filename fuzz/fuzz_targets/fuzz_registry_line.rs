//! Fuzz target for peer registry parsing.
//!
//! Malformed lines are skipped, never fatal, and every peer that parses
//! survives a save/load round trip with its key and cursor intact.

#![no_main]

use chronicle_replication::registry::{parse_registry, Peer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|text: &str| {
    for peer in parse_registry(text) {
        let reparsed = Peer::parse_line(&peer.to_line(), 1).expect("serialized peer must parse");
        assert_eq!(reparsed.public_key, peer.public_key);
        assert_eq!(reparsed.last, peer.last);
    }
});
