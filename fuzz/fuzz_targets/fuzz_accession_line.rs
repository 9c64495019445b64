//! Fuzz target for accession feed line parsing.
//!
//! Arbitrary peer output must never panic the parser, and any digest it
//! accepts must print back as the field it was parsed from.

#![no_main]

use chronicle_replication::stream::parse_accession_line;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|line: &str| {
    if let Ok(digest) = parse_accession_line(line) {
        let field = line.split(',').nth(1).unwrap_or_default().trim();
        assert_eq!(digest.to_string(), field.to_ascii_lowercase());
    }
});
