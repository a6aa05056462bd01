//! Fuzz target for checkpoint file parsing.
//!
//! This tests that `checkpoint::parse` never panics on arbitrary input
//! and that every key it accepts maps to the timestamp written for it.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_connector::checkpoint::parse;

fuzz_target!(|data: &str| {
    // Should never panic
    if let Ok(map) = parse(data) {
        let flat: Vec<String> = map
            .iter()
            .flat_map(|(k, v)| [k.clone(), v.to_string()])
            .collect();
        let rewritten = serde_json::to_string(&flat).unwrap();
        assert_eq!(parse(&rewritten).unwrap(), map);
    }
});
