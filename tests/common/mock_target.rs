//! Recording replication target for testing.
//!
//! Stores documents in memory keyed by `(namespace, id)`, records every
//! call for assertions, and applies `$set`/`$unset` and replacement-style
//! update specs.
//!
//! # Example
//! ```rust,ignore
//! let target = MockTarget::new("index");
//! target.fail_upserts_permanently();
//!
//! // Use in tests...
//!
//! assert_eq!(target.count().await, 5);
//! ```

use bson::{Bson, Document};
use oplog_connector::target::{BoxFuture, BulkUpsert, ReplicatedDocument, ReplicationTarget, TargetError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetCall {
    Upsert(ReplicatedDocument),
    Remove(ReplicatedDocument),
    Update(ReplicatedDocument, Document),
    BulkUpsert(usize),
    Commit,
}

/// In-memory target that records all calls.
pub struct MockTarget {
    name: String,
    supports_bulk: bool,
    docs: RwLock<HashMap<(String, String), ReplicatedDocument>>,
    calls: RwLock<Vec<TargetCall>>,
    /// Upcoming upserts failing with a retryable connection error.
    transient_upsert_failures: AtomicUsize,
    /// Every upsert fails with a non-retryable error.
    upserts_broken: AtomicBool,
    stopped: AtomicBool,
}

impl MockTarget {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, false))
    }

    /// A target that also implements the bulk-load capability.
    pub fn with_bulk(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, true))
    }

    fn build(name: &str, supports_bulk: bool) -> Self {
        Self {
            name: name.to_string(),
            supports_bulk,
            docs: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            transient_upsert_failures: AtomicUsize::new(0),
            upserts_broken: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Seed a stored document without recording a call.
    pub async fn seed(&self, doc: ReplicatedDocument) {
        self.docs.write().await.insert(key_of(&doc), doc);
    }

    pub fn fail_next_upserts(&self, count: usize) {
        self.transient_upsert_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_upserts_permanently(&self) {
        self.upserts_broken.store(true, Ordering::SeqCst);
    }

    pub async fn get(&self, namespace: &str, id: impl Into<Bson>) -> Option<ReplicatedDocument> {
        let key = (namespace.to_string(), id.into().to_string());
        self.docs.read().await.get(&key).cloned()
    }

    pub async fn count(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn calls(&self) -> Vec<TargetCall> {
        self.calls.read().await.clone()
    }

    /// Recorded upserts, removes and updates (commits and bulk calls left out).
    pub async fn writes(&self) -> Vec<TargetCall> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, TargetCall::Upsert(_) | TargetCall::Remove(_) | TargetCall::Update(..)))
            .cloned()
            .collect()
    }

    pub async fn bulk_calls(&self) -> Vec<usize> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                TargetCall::BulkUpsert(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_upsert(&self) -> Result<(), TargetError> {
        if self.upserts_broken.load(Ordering::SeqCst) {
            return Err(TargetError::Failed("mapping rejected".into()));
        }
        let remaining = self.transient_upsert_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_upsert_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TargetError::Connection("backend unavailable".into()));
        }
        Ok(())
    }
}

fn key_of(doc: &ReplicatedDocument) -> (String, String) {
    (doc.namespace.clone(), doc.id.to_string())
}

/// Apply `$set`/`$unset` or a replacement document.
fn apply_spec(fields: &mut Document, id_key: &str, spec: &Document) {
    let operator_style = spec.keys().any(|k| k.starts_with('$'));
    if !operator_style {
        let id = fields.get(id_key).cloned();
        *fields = spec.clone();
        if let Some(id) = id {
            fields.insert(id_key, id);
        }
        return;
    }
    if let Ok(set) = spec.get_document("$set") {
        for (k, v) in set {
            fields.insert(k.clone(), v.clone());
        }
    }
    if let Ok(unset) = spec.get_document("$unset") {
        for k in unset.keys() {
            fields.remove(k);
        }
    }
}

impl ReplicationTarget for MockTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn upsert(&self, doc: ReplicatedDocument) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.write().await.push(TargetCall::Upsert(doc.clone()));
            self.check_upsert()?;
            self.docs.write().await.insert(key_of(&doc), doc);
            Ok(())
        })
    }

    fn remove(&self, doc: ReplicatedDocument) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.write().await.push(TargetCall::Remove(doc.clone()));
            match self.docs.write().await.remove(&key_of(&doc)) {
                Some(_) => Ok(()),
                None => Err(TargetError::NotFound(doc.id.to_string())),
            }
        })
    }

    fn update(&self, doc: ReplicatedDocument, update_spec: Document) -> BoxFuture<'_, ReplicatedDocument> {
        Box::pin(async move {
            self.calls
                .write()
                .await
                .push(TargetCall::Update(doc.clone(), update_spec.clone()));

            let mut docs = self.docs.write().await;
            let key = key_of(&doc);
            let mut stored = docs.remove(&key).unwrap_or_else(|| doc.clone());
            apply_spec(&mut stored.fields, "_id", &update_spec);
            stored.ts = doc.ts;
            docs.insert(key, stored.clone());
            Ok(stored)
        })
    }

    fn search(&self, start_ts: u64, end_ts: u64) -> BoxFuture<'_, Vec<ReplicatedDocument>> {
        Box::pin(async move {
            let mut found: Vec<ReplicatedDocument> = self
                .docs
                .read()
                .await
                .values()
                .filter(|d| d.ts >= start_ts && d.ts <= end_ts)
                .cloned()
                .collect();
            found.sort_by_key(|d| d.ts);
            Ok(found)
        })
    }

    fn commit(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.write().await.push(TargetCall::Commit);
            Ok(())
        })
    }

    fn get_last_doc(&self) -> BoxFuture<'_, Option<ReplicatedDocument>> {
        Box::pin(async move { Ok(self.docs.read().await.values().max_by_key(|d| d.ts).cloned()) })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn bulk(&self) -> Option<&dyn BulkUpsert> {
        if self.supports_bulk {
            Some(self)
        } else {
            None
        }
    }
}

impl BulkUpsert for MockTarget {
    fn bulk_upsert(&self, docs: Vec<ReplicatedDocument>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.write().await.push(TargetCall::BulkUpsert(docs.len()));
            self.check_upsert()?;
            let mut stored = self.docs.write().await;
            for doc in docs {
                stored.insert(key_of(&doc), doc);
            }
            Ok(())
        })
    }
}
