//! Top-level field filtering for documents and oplog entries.
//!
//! Either an allow-list or a deny-list of top-level field names may be
//! configured, never both. The source `_id` and the unique-key field always
//! survive.
//!
//! Update entries are filtered per operator: every `$operator` sub-document
//! (`$set`, `$unset`, `$inc`, ...) keeps only the allowed paths, judged by
//! their first path segment (`a.b` is governed by `a`). An operator left
//! empty is dropped, and an update with no operator left is dropped entirely
//! so that targets never see a no-op write. Replacement-style updates are
//! filtered like inserted documents.

use crate::oplog::{OplogEntry, OplogOp, SOURCE_KEY};
use bson::{Bson, Document};
use std::collections::HashSet;

/// Which top-level fields to replicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldSelection {
    /// Replicate every field.
    #[default]
    All,
    /// Replicate only these fields (plus the unique key).
    Include(HashSet<String>),
    /// Replicate every field except these (the unique key is never excluded).
    Exclude(HashSet<String>),
}

/// Field filter bound to the unique-key field name.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    selection: FieldSelection,
    unique_key: String,
}

impl FieldFilter {
    pub fn new(selection: FieldSelection, unique_key: impl Into<String>) -> Self {
        Self {
            selection,
            unique_key: unique_key.into(),
        }
    }

    /// A filter that keeps everything.
    pub fn all(unique_key: impl Into<String>) -> Self {
        Self::new(FieldSelection::All, unique_key)
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    fn keeps(&self, path: &str) -> bool {
        let top = path.split('.').next().unwrap_or(path);
        if top == SOURCE_KEY || top == self.unique_key {
            return true;
        }
        match &self.selection {
            FieldSelection::All => true,
            FieldSelection::Include(fields) => fields.contains(top),
            FieldSelection::Exclude(fields) => !fields.contains(top),
        }
    }

    /// Filter a full document.
    pub fn filter_document(&self, doc: Document) -> Document {
        if self.selection == FieldSelection::All {
            return doc;
        }
        doc.into_iter().filter(|(k, _)| self.keeps(k)).collect()
    }

    /// Filter an update spec. Returns `None` when nothing is left to apply.
    pub fn filter_update(&self, spec: Document) -> Option<Document> {
        let is_operator_style = spec.keys().any(|k| k.starts_with('$'));
        if !is_operator_style {
            return Some(self.filter_document(spec));
        }

        let mut filtered = Document::new();
        let mut remaining_ops = 0;
        for (op, value) in spec {
            match value {
                Bson::Document(fields) if op.starts_with('$') => {
                    let kept: Document = fields.into_iter().filter(|(k, _)| self.keeps(k)).collect();
                    if !kept.is_empty() {
                        remaining_ops += 1;
                        filtered.insert(op, kept);
                    }
                }
                // `$v` and other scalar markers ride along but do not count.
                other if op.starts_with('$') => {
                    filtered.insert(op, other);
                }
                other => {
                    remaining_ops += 1;
                    filtered.insert(op, other);
                }
            }
        }

        (remaining_ops > 0).then_some(filtered)
    }

    /// Filter an oplog entry. Returns `None` when the entry should be skipped.
    pub fn filter_entry(&self, mut entry: OplogEntry) -> Option<OplogEntry> {
        if self.selection == FieldSelection::All {
            return Some(entry);
        }
        match entry.op {
            OplogOp::Insert => {
                entry.object = self.filter_document(entry.object);
                Some(entry)
            }
            OplogOp::Update => {
                entry.object = self.filter_update(entry.object)?;
                Some(entry)
            }
            _ => Some(entry),
        }
    }
}
