//! In-memory MongoDB for testing.
//!
//! `MockReplicaSet` keeps an oplog and a set of collections behind locks.
//! Tail cursors are snapshots: they yield every matching entry present when
//! the cursor was opened and then close, which makes the tailer reposition
//! and pick up anything appended since.
//!
//! Failures can be injected into cursors and reconnects.

use bson::{doc, Bson, Document};
use futures::stream::{self, StreamExt};
use oplog_connector::namespace::NamespaceFilter;
use oplog_connector::source::{ClusterClient, DocumentStream, OplogStream, ShardDescriptor, SourceFuture};
use oplog_connector::{ConnectorError, OplogEntry, OplogOp, OplogSource, OplogTimestamp};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Build an insert entry.
pub fn insert(ts: OplogTimestamp, ns: &str, object: Document) -> OplogEntry {
    entry(ts, OplogOp::Insert, ns, object, None)
}

/// Build an update entry for `_id = id`.
pub fn update(ts: OplogTimestamp, ns: &str, id: impl Into<Bson>, spec: Document) -> OplogEntry {
    entry(ts, OplogOp::Update, ns, spec, Some(doc! { "_id": id.into() }))
}

/// Build a delete entry for `_id = id`.
pub fn delete(ts: OplogTimestamp, ns: &str, id: impl Into<Bson>) -> OplogEntry {
    entry(ts, OplogOp::Delete, ns, doc! { "_id": id.into() }, None)
}

/// Build a no-op entry.
pub fn noop(ts: OplogTimestamp) -> OplogEntry {
    entry(ts, OplogOp::Noop, "", doc! { "msg": "periodic noop" }, None)
}

/// Build a command entry.
pub fn command(ts: OplogTimestamp, ns: &str) -> OplogEntry {
    entry(ts, OplogOp::Command, ns, doc! { "create": "c" }, None)
}

fn entry(
    ts: OplogTimestamp,
    op: OplogOp,
    ns: &str,
    object: Document,
    selector: Option<Document>,
) -> OplogEntry {
    OplogEntry {
        ts,
        op,
        ns: ns.to_string(),
        object,
        selector,
        from_migrate: false,
    }
}

/// One in-memory replica set.
pub struct MockReplicaSet {
    name: String,
    oplog: RwLock<Vec<OplogEntry>>,
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
    /// Next cursor fails after yielding this many entries.
    cursor_failure: RwLock<Option<usize>>,
    /// Next cursor yields an unparseable entry after this many entries.
    malformed_at: RwLock<Option<usize>>,
    /// Number of upcoming reconnect attempts that fail.
    failing_reconnects: AtomicUsize,
    /// Reconnects fail with a non-retryable error.
    reconnect_fatal: AtomicBool,
    reconnects: AtomicUsize,
    cursors_opened: AtomicUsize,
}

impl MockReplicaSet {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            oplog: RwLock::new(Vec::new()),
            collections: RwLock::new(BTreeMap::new()),
            cursor_failure: RwLock::new(None),
            malformed_at: RwLock::new(None),
            failing_reconnects: AtomicUsize::new(0),
            reconnect_fatal: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
            cursors_opened: AtomicUsize::new(0),
        })
    }

    /// Append entries, keeping the oplog ordered.
    pub async fn push(&self, entries: impl IntoIterator<Item = OplogEntry>) {
        let mut oplog = self.oplog.write().await;
        oplog.extend(entries);
        oplog.sort_by_key(|e| e.ts);
    }

    /// Drop entries older than `ts` (retention).
    pub async fn truncate_before(&self, ts: OplogTimestamp) {
        self.oplog.write().await.retain(|e| e.ts >= ts);
    }

    /// Drop entries newer than `ts` (writes lost in an election).
    pub async fn truncate_after(&self, ts: OplogTimestamp) {
        self.oplog.write().await.retain(|e| e.ts <= ts);
    }

    pub async fn set_collection(&self, ns: &str, docs: Vec<Document>) {
        self.collections.write().await.insert(ns.to_string(), docs);
    }

    /// Make the next cursor fail with a retryable error after `after` entries.
    pub async fn fail_next_cursor_after(&self, after: usize) {
        *self.cursor_failure.write().await = Some(after);
    }

    /// Make the next cursor yield an entry with an unknown op code after `after` entries.
    pub async fn inject_malformed_after(&self, after: usize) {
        *self.malformed_at.write().await = Some(after);
    }

    pub fn fail_reconnects(&self, count: usize) {
        self.failing_reconnects.store(count, Ordering::SeqCst);
    }

    pub fn make_reconnect_fatal(&self) {
        self.reconnect_fatal.store(true, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn cursors_opened(&self) -> usize {
        self.cursors_opened.load(Ordering::SeqCst)
    }

    /// Entries at or after `from`; the one exactly at `from` always matches.
    async fn matching(&self, from: OplogTimestamp, filter: &NamespaceFilter) -> Vec<OplogEntry> {
        self.oplog
            .read()
            .await
            .iter()
            .filter(|e| e.ts >= from)
            .filter(|e| e.ts == from || !filter.has_allow_list() || filter.is_included(&e.ns))
            .cloned()
            .collect()
    }
}

impl OplogSource for MockReplicaSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn oplog_top(&self) -> SourceFuture<'_, Option<OplogTimestamp>> {
        Box::pin(async move { Ok(self.oplog.read().await.last().map(|e| e.ts)) })
    }

    fn count_entries<'a>(
        &'a self,
        from: OplogTimestamp,
        filter: &'a NamespaceFilter,
    ) -> SourceFuture<'a, u64> {
        Box::pin(async move { Ok(self.matching(from, filter).await.len() as u64) })
    }

    fn tail<'a>(&'a self, from: OplogTimestamp, filter: &'a NamespaceFilter) -> SourceFuture<'a, OplogStream> {
        Box::pin(async move {
            self.cursors_opened.fetch_add(1, Ordering::SeqCst);
            let entries = self.matching(from, filter).await;
            let failure = self.cursor_failure.write().await.take();

            let mut items: Vec<Result<OplogEntry, ConnectorError>> = match failure {
                Some(after) => entries
                    .into_iter()
                    .take(after)
                    .map(Ok)
                    .chain(std::iter::once(Err(ConnectorError::mongo(
                        "getMore",
                        "connection reset by peer",
                    ))))
                    .collect(),
                None => entries.into_iter().map(Ok).collect(),
            };
            if let Some(at) = self.malformed_at.write().await.take() {
                let raw = doc! { "ts": bson::Timestamp { time: 0, increment: 0 }, "op": "x", "ns": "db.a" };
                items.insert(at.min(items.len()), OplogEntry::from_document(&raw));
            }

            // Like awaitData: hold the exhausted cursor open briefly before it closes.
            let linger = stream::once(tokio::time::sleep(Duration::from_millis(10)))
                .filter_map(|_| async { None::<Result<OplogEntry, ConnectorError>> });
            Ok(stream::iter(items).chain(linger).boxed())
        })
    }

    fn entry_at_or_before(&self, at: OplogTimestamp) -> SourceFuture<'_, Option<OplogTimestamp>> {
        Box::pin(async move {
            Ok(self
                .oplog
                .read()
                .await
                .iter()
                .rev()
                .find(|e| e.ts <= at)
                .map(|e| e.ts))
        })
    }

    fn find_documents<'a>(
        &'a self,
        ns: &'a str,
        key_field: &'a str,
        ids: Vec<Bson>,
    ) -> SourceFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let collections = self.collections.read().await;
            Ok(collections
                .get(ns)
                .map(|docs| {
                    docs.iter()
                        .filter(|d| d.get(key_field).map_or(false, |id| ids.contains(id)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn list_namespaces(&self) -> SourceFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.collections.read().await.keys().cloned().collect()) })
    }

    fn dump_collection<'a>(&'a self, ns: &'a str) -> SourceFuture<'a, DocumentStream> {
        Box::pin(async move {
            let docs = self.collections.read().await.get(ns).cloned().unwrap_or_default();
            Ok(stream::iter(docs.into_iter().map(Ok)).boxed())
        })
    }

    fn reconnect(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if self.reconnect_fatal.load(Ordering::SeqCst) {
                return Err(ConnectorError::Config("authentication failed".into()));
            }
            let remaining = self.failing_reconnects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_reconnects.store(remaining - 1, Ordering::SeqCst);
                return Err(ConnectorError::mongo("ping", "no primary available"));
            }
            Ok(())
        })
    }
}

/// In-memory entry point: a replica set member, a standalone node or a router.
pub struct MockCluster {
    sharded: bool,
    replica_set: Option<String>,
    shards: RwLock<Vec<(String, String)>>,
    sets: RwLock<HashMap<String, Arc<MockReplicaSet>>>,
}

impl MockCluster {
    /// Entry point is a member of `rs`.
    pub fn replica_set(rs: Arc<MockReplicaSet>) -> Arc<Self> {
        let mut sets = HashMap::new();
        let name = rs.name().to_string();
        sets.insert(name.clone(), rs);
        Arc::new(Self {
            sharded: false,
            replica_set: Some(name),
            shards: RwLock::new(Vec::new()),
            sets: RwLock::new(sets),
        })
    }

    /// Entry point is a node with no replica set configured.
    pub fn standalone() -> Arc<Self> {
        Arc::new(Self {
            sharded: false,
            replica_set: None,
            shards: RwLock::new(Vec::new()),
            sets: RwLock::new(HashMap::new()),
        })
    }

    /// Entry point is a router with no shards yet.
    pub fn sharded() -> Arc<Self> {
        Arc::new(Self {
            sharded: true,
            replica_set: None,
            shards: RwLock::new(Vec::new()),
            sets: RwLock::new(HashMap::new()),
        })
    }

    /// Register a shard backed by `rs`, as `config.shards` would list it.
    pub async fn add_shard(&self, shard_id: &str, rs: Arc<MockReplicaSet>) {
        let host = format!("{}/{}-a:27017,{}-b:27017", rs.name(), shard_id, shard_id);
        self.sets.write().await.insert(rs.name().to_string(), rs);
        self.add_raw_shard(shard_id, &host).await;
    }

    /// Register a `config.shards` row verbatim.
    pub async fn add_raw_shard(&self, shard_id: &str, host: &str) {
        self.shards
            .write()
            .await
            .push((shard_id.to_string(), host.to_string()));
    }

    async fn set_named(&self, name: &str) -> Result<Arc<dyn OplogSource>, ConnectorError> {
        self.sets
            .read()
            .await
            .get(name)
            .map(|rs| Arc::clone(rs) as Arc<dyn OplogSource>)
            .ok_or_else(|| ConnectorError::mongo("connect", format!("no replica set {}", name)))
    }
}

impl ClusterClient for MockCluster {
    fn is_sharded(&self) -> SourceFuture<'_, bool> {
        Box::pin(async move { Ok(self.sharded) })
    }

    fn replica_set_name(&self) -> SourceFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.replica_set.clone()) })
    }

    fn list_shards(&self) -> SourceFuture<'_, Vec<(String, String)>> {
        Box::pin(async move { Ok(self.shards.read().await.clone()) })
    }

    fn connect_main(&self, replica_set_name: String) -> SourceFuture<'_, Arc<dyn OplogSource>> {
        Box::pin(async move { self.set_named(&replica_set_name).await })
    }

    fn connect_shard<'a>(&'a self, shard: &'a ShardDescriptor) -> SourceFuture<'a, Arc<dyn OplogSource>> {
        Box::pin(async move { self.set_named(&shard.replica_set_name).await })
    }
}
