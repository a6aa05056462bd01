// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication target contract.
//!
//! A replication target turns generic replication operations into writes
//! against some backend (a search index, another database, a simulator).
//! Concrete backends live outside this crate and implement
//! [`ReplicationTarget`]; the connector only ever talks to the trait.
//!
//! # Capabilities
//!
//! Bulk loading is an optional capability: a target that can ingest large
//! batches returns `Some(self)` from [`ReplicationTarget::bulk`] and
//! implements [`BulkUpsert`]. The initial collection dump uses it when
//! present and falls back to one-by-one upserts otherwise.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_connector::target::{BoxFuture, ReplicatedDocument, ReplicationTarget};
//! use bson::Document;
//!
//! struct Stdout;
//!
//! impl ReplicationTarget for Stdout {
//!     fn name(&self) -> &str { "stdout" }
//!     fn upsert(&self, doc: ReplicatedDocument) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { println!("{}", doc.to_document()); Ok(()) })
//!     }
//!     fn remove(&self, _doc: ReplicatedDocument) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn update(&self, doc: ReplicatedDocument, _spec: Document) -> BoxFuture<'_, ReplicatedDocument> {
//!         Box::pin(async move { Ok(doc) })
//!     }
//!     fn search(&self, _start: u64, _end: u64) -> BoxFuture<'_, Vec<ReplicatedDocument>> {
//!         Box::pin(async { Ok(Vec::new()) })
//!     }
//!     fn commit(&self) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//!     fn get_last_doc(&self) -> BoxFuture<'_, Option<ReplicatedDocument>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!     fn stop(&self) -> BoxFuture<'_, ()> { Box::pin(async { Ok(()) }) }
//! }
//! ```

use crate::config::TargetConfig;
use crate::error::{ConnectorError, Result};
use crate::timestamp::OplogTimestamp;
use bson::{Bson, Document};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Field carrying the source namespace in documents handed to targets.
pub const NAMESPACE_FIELD: &str = "ns";

/// Field carrying the packed oplog timestamp in documents handed to targets.
pub const TIMESTAMP_FIELD: &str = "_ts";

/// Result type for target operations.
pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Boxed async future returned by target operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = TargetResult<T>> + Send + 'a>>;

/// Errors a target may report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TargetError {
    /// The document does not exist in the target.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The backend is unreachable; the operation may succeed later.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend rejected the operation.
    #[error("operation failed: {0}")]
    Failed(String),
}

impl TargetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TargetError::Connection(_))
    }
}

/// A document as shipped to a target.
///
/// `fields` holds the (filtered) source document including its unique key;
/// `namespace` is already remapped; `ts` is the packed oplog timestamp of the
/// write that produced this version.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedDocument {
    pub id: Bson,
    pub namespace: String,
    pub ts: u64,
    pub fields: Document,
}

impl ReplicatedDocument {
    pub fn new(id: Bson, namespace: impl Into<String>, ts: OplogTimestamp, fields: Document) -> Self {
        Self {
            id,
            namespace: namespace.into(),
            ts: ts.as_u64(),
            fields,
        }
    }

    /// A key-only document, used for removes and update selectors.
    pub fn key_only(id: Bson, namespace: impl Into<String>, ts: OplogTimestamp) -> Self {
        Self::new(id, namespace, ts, Document::new())
    }

    pub fn timestamp(&self) -> OplogTimestamp {
        OplogTimestamp::from_u64(self.ts)
    }

    /// The fields with `ns` and `_ts` attached, ready for storage.
    ///
    /// `_ts` is stored as a signed 64-bit integer since BSON has no unsigned
    /// type; the bit pattern is preserved.
    pub fn to_document(&self) -> Document {
        let mut doc = self.fields.clone();
        doc.insert(NAMESPACE_FIELD, self.namespace.clone());
        doc.insert(TIMESTAMP_FIELD, Bson::Int64(self.ts as i64));
        doc
    }

    /// Rebuild from a stored document (inverse of [`to_document`](Self::to_document)).
    ///
    /// Returns `None` if the key, namespace or timestamp is missing.
    pub fn from_document(mut doc: Document, unique_key: &str) -> Option<Self> {
        let id = doc.get(unique_key)?.clone();
        let namespace = match doc.remove(NAMESPACE_FIELD)? {
            Bson::String(ns) => ns,
            _ => return None,
        };
        let ts = match doc.remove(TIMESTAMP_FIELD)? {
            Bson::Int64(v) => v as u64,
            Bson::Int32(v) => v as u64,
            _ => return None,
        };
        Some(Self {
            id,
            namespace,
            ts,
            fields: doc,
        })
    }
}

/// The base contract every backend implements.
///
/// All operations are awaited in oplog order by the owning tailer; an
/// implementation may block as long as it needs to, at the cost of
/// stalling its shard.
pub trait ReplicationTarget: Send + Sync + 'static {
    /// Human-readable name used in logs and metrics.
    fn name(&self) -> &str;

    /// Insert or replace a document.
    fn upsert(&self, doc: ReplicatedDocument) -> BoxFuture<'_, ()>;

    /// Remove a document. `doc.fields` is empty; the key, namespace and
    /// timestamp identify it. Removing an absent document should report
    /// [`TargetError::NotFound`].
    fn remove(&self, doc: ReplicatedDocument) -> BoxFuture<'_, ()>;

    /// Apply a raw MongoDB update spec to a document and return the result.
    ///
    /// The spec is passed through untouched: each target owns its own
    /// operator semantics.
    fn update(&self, doc: ReplicatedDocument, update_spec: Document) -> BoxFuture<'_, ReplicatedDocument>;

    /// Every document whose stored `_ts` lies in `[start_ts, end_ts]`.
    fn search(&self, start_ts: u64, end_ts: u64) -> BoxFuture<'_, Vec<ReplicatedDocument>>;

    /// Make previously acknowledged writes visible/durable.
    fn commit(&self) -> BoxFuture<'_, ()>;

    /// The document with the greatest `_ts`, if any.
    fn get_last_doc(&self) -> BoxFuture<'_, Option<ReplicatedDocument>>;

    /// Release resources. Called once when the connector stops.
    fn stop(&self) -> BoxFuture<'_, ()>;

    /// Optional bulk-load capability.
    fn bulk(&self) -> Option<&dyn BulkUpsert> {
        None
    }
}

/// Capability: ingest many documents in one call.
pub trait BulkUpsert: Send + Sync {
    fn bulk_upsert(&self, docs: Vec<ReplicatedDocument>) -> BoxFuture<'_, ()>;
}

/// Constructor resolving a [`TargetConfig`] into a live target.
pub type TargetConstructor =
    Box<dyn Fn(&TargetConfig) -> Result<Arc<dyn ReplicationTarget>> + Send + Sync>;

/// Name → constructor registry, populated by the embedding binary and
/// resolved once at startup.
#[derive(Default)]
pub struct TargetRegistry {
    constructors: HashMap<String, TargetConstructor>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&TargetConfig) -> Result<Arc<dyn ReplicationTarget>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Box::new(constructor));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build one target.
    pub fn build(&self, config: &TargetConfig) -> Result<Arc<dyn ReplicationTarget>> {
        let constructor = self.constructors.get(&config.kind).ok_or_else(|| {
            ConnectorError::Config(format!(
                "unknown target kind {:?} (registered: {})",
                config.kind,
                self.kinds().join(", ")
            ))
        })?;
        constructor(config)
    }

    /// Build every configured target, failing on the first error.
    pub fn build_all(&self, configs: &[TargetConfig]) -> Result<Vec<Arc<dyn ReplicationTarget>>> {
        configs.iter().map(|c| self.build(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    struct Nothing;

    impl ReplicationTarget for Nothing {
        fn name(&self) -> &str {
            "nothing"
        }
        fn upsert(&self, _doc: ReplicatedDocument) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn remove(&self, doc: ReplicatedDocument) -> BoxFuture<'_, ()> {
            Box::pin(async move { Err(TargetError::NotFound(doc.id.to_string())) })
        }
        fn update(&self, doc: ReplicatedDocument, _spec: Document) -> BoxFuture<'_, ReplicatedDocument> {
            Box::pin(async move { Ok(doc) })
        }
        fn search(&self, _s: u64, _e: u64) -> BoxFuture<'_, Vec<ReplicatedDocument>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn commit(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn get_last_doc(&self) -> BoxFuture<'_, Option<ReplicatedDocument>> {
            Box::pin(async { Ok(None) })
        }
        fn stop(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_document_round_trip_through_storage_form() {
        let doc = ReplicatedDocument::new(
            Bson::Int32(1),
            "db.users",
            OplogTimestamp::new(u32::MAX, 5),
            doc! { "_id": 1, "name": "ada" },
        );
        let stored = doc.to_document();
        assert_eq!(stored.get_str(NAMESPACE_FIELD).unwrap(), "db.users");

        let back = ReplicatedDocument::from_document(stored, "_id").unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.timestamp(), OplogTimestamp::new(u32::MAX, 5));
    }

    #[test]
    fn test_from_document_requires_metadata() {
        assert!(ReplicatedDocument::from_document(doc! { "_id": 1 }, "_id").is_none());
        assert!(ReplicatedDocument::from_document(doc! { "ns": "a.b", "_ts": 1i64 }, "_id").is_none());
    }

    #[test]
    fn test_bulk_capability_defaults_to_none() {
        assert!(Nothing.bulk().is_none());
    }

    #[test]
    fn test_target_error_retryable() {
        assert!(TargetError::Connection("x".into()).is_retryable());
        assert!(!TargetError::NotFound("x".into()).is_retryable());
        assert!(!TargetError::Failed("x".into()).is_retryable());
    }

    #[test]
    fn test_registry_builds_registered_kind() {
        let mut registry = TargetRegistry::new();
        registry.register("nothing", |_cfg: &TargetConfig| {
            Ok(Arc::new(Nothing) as Arc<dyn ReplicationTarget>)
        });

        assert!(registry.contains("nothing"));
        let target = registry.build(&TargetConfig::new("nothing")).unwrap();
        assert_eq!(target.name(), "nothing");
    }

    #[test]
    fn test_registry_rejects_unknown_kind() {
        let registry = TargetRegistry::new();
        match registry.build(&TargetConfig::new("solr")) {
            Err(ConnectorError::Config(msg)) => assert!(msg.contains("solr")),
            other => panic!("expected Config error, got {:?}", other.map(|t| t.name().to_string())),
        }
    }
}
