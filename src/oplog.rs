// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog entry model.
//!
//! Parses raw `local.oplog.rs` documents into [`OplogEntry`]. Only the
//! fields the connector acts on are extracted:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `ts` | BSON timestamp, the entry's position |
//! | `op` | `i` insert, `u` update, `d` delete, `c` command, `n` no-op |
//! | `ns` | `database.collection` |
//! | `o` | inserted document, update spec, or delete selector |
//! | `o2` | update selector (carries the document key) |
//! | `fromMigrate` | set on writes caused by chunk migrations |

use crate::error::{ConnectorError, Result};
use crate::timestamp::OplogTimestamp;
use bson::{Bson, Document};

/// Field that identifies a document in the source. Oplog update selectors
/// and delete entries carry only this field.
pub const SOURCE_KEY: &str = "_id";

/// Oplog operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OplogOp {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
}

impl OplogOp {
    /// Parse the single-letter `op` code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(OplogOp::Insert),
            "u" => Some(OplogOp::Update),
            "d" => Some(OplogOp::Delete),
            "c" => Some(OplogOp::Command),
            "n" => Some(OplogOp::Noop),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OplogOp::Insert => "i",
            OplogOp::Update => "u",
            OplogOp::Delete => "d",
            OplogOp::Command => "c",
            OplogOp::Noop => "n",
        }
    }

    /// Whether this operation changes a single document.
    pub fn is_data_op(&self) -> bool {
        matches!(self, OplogOp::Insert | OplogOp::Update | OplogOp::Delete)
    }
}

/// A parsed oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    pub ts: OplogTimestamp,
    pub op: OplogOp,
    pub ns: String,
    /// `o`: the document, update spec or delete selector.
    pub object: Document,
    /// `o2`: update selector.
    pub selector: Option<Document>,
    pub from_migrate: bool,
}

impl OplogEntry {
    /// Parse a raw oplog document.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let ts: OplogTimestamp = doc
            .get_timestamp("ts")
            .map_err(|_| ConnectorError::MalformedEntry("missing or non-timestamp `ts`".into()))?
            .into();

        let code = doc
            .get_str("op")
            .map_err(|_| ConnectorError::MalformedEntry(format!("entry {} has no `op`", ts)))?;
        let op = OplogOp::from_code(code).ok_or_else(|| {
            ConnectorError::MalformedEntry(format!("entry {} has unknown op {:?}", ts, code))
        })?;

        let ns = doc.get_str("ns").unwrap_or_default().to_string();
        let object = doc.get_document("o").cloned().unwrap_or_default();
        let selector = doc.get_document("o2").ok().cloned();
        let from_migrate = matches!(doc.get("fromMigrate"), Some(Bson::Boolean(true)));

        if op.is_data_op() && ns.is_empty() {
            return Err(ConnectorError::MalformedEntry(format!(
                "{} entry {} has no namespace",
                op.code(),
                ts
            )));
        }

        Ok(Self {
            ts,
            op,
            ns,
            object,
            selector,
            from_migrate,
        })
    }

    /// The affected document's `_id`.
    ///
    /// Updates carry it in `o2`; inserts and deletes carry it in `o`.
    pub fn document_key(&self) -> Option<&Bson> {
        match self.op {
            OplogOp::Update => self
                .selector
                .as_ref()
                .and_then(|s| s.get(SOURCE_KEY))
                .or_else(|| self.object.get(SOURCE_KEY)),
            _ => self.object.get(SOURCE_KEY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Timestamp};

    fn ts(time: u32, increment: u32) -> Timestamp {
        Timestamp { time, increment }
    }

    #[test]
    fn test_parse_insert() {
        let raw = doc! {
            "ts": ts(100, 1),
            "op": "i",
            "ns": "db.users",
            "o": { "_id": 1, "name": "ada" },
        };
        let entry = OplogEntry::from_document(&raw).unwrap();
        assert_eq!(entry.op, OplogOp::Insert);
        assert_eq!(entry.ns, "db.users");
        assert_eq!(entry.ts, OplogTimestamp::new(100, 1));
        assert_eq!(entry.document_key(), Some(&Bson::Int32(1)));
        assert!(!entry.from_migrate);
    }

    #[test]
    fn test_parse_update_key_from_selector() {
        let raw = doc! {
            "ts": ts(100, 2),
            "op": "u",
            "ns": "db.users",
            "o2": { "_id": "abc" },
            "o": { "$set": { "name": "grace" } },
        };
        let entry = OplogEntry::from_document(&raw).unwrap();
        assert_eq!(entry.op, OplogOp::Update);
        assert_eq!(entry.document_key(), Some(&Bson::String("abc".into())));
    }

    #[test]
    fn test_parse_from_migrate() {
        let raw = doc! {
            "ts": ts(100, 3),
            "op": "d",
            "ns": "db.users",
            "o": { "_id": 1 },
            "fromMigrate": true,
        };
        assert!(OplogEntry::from_document(&raw).unwrap().from_migrate);
    }

    #[test]
    fn test_noop_without_namespace_is_fine() {
        let raw = doc! { "ts": ts(1, 1), "op": "n", "ns": "", "o": { "msg": "periodic noop" } };
        let entry = OplogEntry::from_document(&raw).unwrap();
        assert!(!entry.op.is_data_op());
    }

    #[test]
    fn test_malformed_entries() {
        assert!(OplogEntry::from_document(&doc! { "op": "i" }).is_err());
        assert!(OplogEntry::from_document(&doc! { "ts": ts(1, 1) }).is_err());
        assert!(OplogEntry::from_document(&doc! { "ts": ts(1, 1), "op": "x", "ns": "a.b" }).is_err());
        assert!(OplogEntry::from_document(&doc! { "ts": ts(1, 1), "op": "i", "o": {} }).is_err());
    }

    #[test]
    fn test_op_codes_round_trip() {
        for op in [OplogOp::Insert, OplogOp::Update, OplogOp::Delete, OplogOp::Command, OplogOp::Noop] {
            assert_eq!(OplogOp::from_code(op.code()), Some(op));
        }
    }
}
