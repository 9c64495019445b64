//! Fuzz target for canonical JSON.
//!
//! Canonical bytes must themselves be valid JSON that canonicalizes to the
//! same bytes, so a record's digest is stable across re-serialization.

#![no_main]

use chronicle_replication::crypto::canonicalize;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(document) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    let canonical = canonicalize(&document);
    let reparsed: Value = serde_json::from_slice(&canonical).expect("canonical form must be JSON");
    assert_eq!(canonicalize(&reparsed), canonical);
});
