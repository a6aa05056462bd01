//! Source seam: the parts of MongoDB the connector talks to.
//!
//! [`ClusterClient`] is the entry point (a replica set member or a `mongos`);
//! it answers topology questions and hands out one [`OplogSource`] per
//! replica set. An `OplogSource` reads that replica set's oplog and
//! collections.
//!
//! Production code uses [`crate::mongo`]; tests plug in in-memory fakes.

use crate::error::Result;
use crate::namespace::NamespaceFilter;
use crate::oplog::OplogEntry;
use crate::timestamp::OplogTimestamp;
use bson::{Bson, Document};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by source operations.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Tailing cursor over oplog entries, in oplog order.
///
/// A tailable stream stays open at the end of the oplog and yields new
/// entries as they are written. It ends when the server closes the cursor.
pub type OplogStream = BoxStream<'static, Result<OplogEntry>>;

/// Stream of whole documents from one collection.
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// One shard as listed in `config.shards`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardDescriptor {
    pub shard_id: String,
    pub replica_set_name: String,
    pub hosts: Vec<String>,
}

/// Read access to one replica set.
pub trait OplogSource: Send + Sync + 'static {
    /// Replica set name; also the checkpoint key.
    fn name(&self) -> &str;

    /// Timestamp of the newest oplog entry, `None` if the oplog is empty.
    fn oplog_top(&self) -> SourceFuture<'_, Option<OplogTimestamp>>;

    /// Count entries with `ts >= from` that pass the namespace filter.
    ///
    /// The entry exactly at `from` counts even when its namespace is
    /// filtered out; `tail` follows the same rule.
    fn count_entries<'a>(
        &'a self,
        from: OplogTimestamp,
        filter: &'a NamespaceFilter,
    ) -> SourceFuture<'a, u64>;

    /// Open a tailing cursor on entries with `ts >= from` that pass the filter.
    fn tail<'a>(&'a self, from: OplogTimestamp, filter: &'a NamespaceFilter) -> SourceFuture<'a, OplogStream>;

    /// Newest entry with `ts <= at`, ignoring namespace filters.
    fn entry_at_or_before(&self, at: OplogTimestamp) -> SourceFuture<'_, Option<OplogTimestamp>>;

    /// Current versions of the documents with the given keys in `ns`.
    /// Documents that no longer exist are simply absent from the result.
    fn find_documents<'a>(
        &'a self,
        ns: &'a str,
        key_field: &'a str,
        ids: Vec<Bson>,
    ) -> SourceFuture<'a, Vec<Document>>;

    /// Every user namespace (`db.collection`) currently present.
    fn list_namespaces(&self) -> SourceFuture<'_, Vec<String>>;

    /// Stream every document of one collection.
    fn dump_collection<'a>(&'a self, ns: &'a str) -> SourceFuture<'a, DocumentStream>;

    /// Drop and rebuild the underlying connection (re-authenticating when
    /// credentials are configured).
    fn reconnect(&self) -> SourceFuture<'_, ()>;
}

/// The connector's entry point into a deployment.
pub trait ClusterClient: Send + Sync + 'static {
    /// Whether the entry point is a `mongos` router.
    fn is_sharded(&self) -> SourceFuture<'_, bool>;

    /// Replica set name of the entry point, `None` for a standalone node.
    fn replica_set_name(&self) -> SourceFuture<'_, Option<String>>;

    /// Raw `(shard_id, host)` pairs from `config.shards`.
    fn list_shards(&self) -> SourceFuture<'_, Vec<(String, String)>>;

    /// Source for the entry point itself (single replica set mode).
    fn connect_main(&self, replica_set_name: String) -> SourceFuture<'_, Arc<dyn OplogSource>>;

    /// Source for one shard.
    fn connect_shard<'a>(&'a self, shard: &'a ShardDescriptor) -> SourceFuture<'a, Arc<dyn OplogSource>>;
}
