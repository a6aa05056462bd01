//! Fuzz target for oplog entry parsing and filtering.
//!
//! Feeds arbitrary BSON bytes through `OplogEntry::from_document`, then the
//! field filter, checking that nothing panics on malformed entries.

#![no_main]

use bson::Document;
use libfuzzer_sys::fuzz_target;
use oplog_connector::{FieldFilter, FieldSelection, OplogEntry, OplogOp};

fuzz_target!(|data: &[u8]| {
    let Ok(doc) = Document::from_reader(data) else {
        return;
    };

    // Should never panic
    let Ok(entry) = OplogEntry::from_document(&doc) else {
        return;
    };
    let _ = entry.document_key();

    let filter = FieldFilter::new(FieldSelection::Include(["a".to_string()].into_iter().collect()), "_id");
    if let Some(filtered) = filter.filter_entry(entry) {
        if filtered.op == OplogOp::Insert {
            for key in filtered.object.keys() {
                let top = key.split('.').next().unwrap_or(key);
                assert!(top == "_id" || top == "a", "insert kept {:?}", key);
            }
        }
    }
});
