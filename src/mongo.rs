// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB implementation of the source seam.
//!
//! - [`MongoCluster`]: the configured entry point. Answers `isMaster`,
//!   lists `config.shards`, and opens per-replica-set sources.
//! - [`MongoReplicaSet`]: one replica set's oplog and collections.
//!
//! Each source keeps its [`ClientOptions`] so that [`OplogSource::reconnect`]
//! can rebuild the client from scratch, credentials included.

use crate::config::{AuthConfig, ConnectorConfig};
use crate::error::{ConnectorError, Result};
use crate::namespace::{is_internal_namespace, NamespaceFilter};
use crate::oplog::OplogEntry;
use crate::source::{
    ClusterClient, DocumentStream, OplogSource, OplogStream, ShardDescriptor, SourceFuture,
};
use crate::timestamp::OplogTimestamp;
use bson::{doc, Bson, Document, Timestamp};
use futures::{StreamExt, TryStreamExt};
use mongodb::error::ErrorKind;
use mongodb::options::{
    ClientOptions, Credential, CursorType, FindOneOptions, FindOptions, ServerAddress,
};
use mongodb::{Client, Collection};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const OPLOG_DATABASE: &str = "local";
const OPLOG_COLLECTION: &str = "oplog.rs";

/// Map a driver error, treating bad credentials and arguments as configuration errors.
fn mongo_error(operation: &str, e: mongodb::error::Error) -> ConnectorError {
    match e.kind.as_ref() {
        ErrorKind::Authentication { .. } | ErrorKind::InvalidArgument { .. } => {
            ConnectorError::Config(format!("{}: {}", operation, e))
        }
        _ => ConnectorError::mongo(operation, e),
    }
}

fn credential(auth: &AuthConfig) -> Credential {
    let mut credential = Credential::default();
    credential.username = Some(auth.username.clone());
    credential.password = Some(auth.password.clone());
    credential.source = Some(auth.source.clone());
    credential
}

fn split_namespace(ns: &str) -> Result<(&str, &str)> {
    ns.split_once('.')
        .filter(|(db, coll)| !db.is_empty() && !coll.is_empty())
        .ok_or_else(|| ConnectorError::Internal(format!("invalid namespace {:?}", ns)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entry point
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection to the configured entry point.
pub struct MongoCluster {
    options: ClientOptions,
    client: Client,
}

impl MongoCluster {
    /// Parse the connection string, apply credentials and build a client.
    ///
    /// The driver connects lazily; the first command does the network work.
    pub async fn connect(config: &ConnectorConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.main_address)
            .await
            .map_err(|e| mongo_error("parse_address", e))?;
        if let Some(auth) = &config.auth {
            options.credential = Some(credential(auth));
        }
        options.app_name = Some("oplog-connector".to_string());

        let client = Client::with_options(options.clone()).map_err(|e| mongo_error("connect", e))?;
        info!(address = %config.main_address, "Connected to entry point");
        Ok(Self { options, client })
    }

    async fn is_master(&self) -> Result<Document> {
        self.client
            .database("admin")
            .run_command(doc! { "isMaster": 1 }, None)
            .await
            .map_err(|e| mongo_error("isMaster", e))
    }
}

impl ClusterClient for MongoCluster {
    fn is_sharded(&self) -> SourceFuture<'_, bool> {
        Box::pin(async move {
            let reply = self.is_master().await?;
            Ok(reply.get_str("msg").map(|m| m == "isdbgrid").unwrap_or(false))
        })
    }

    fn replica_set_name(&self) -> SourceFuture<'_, Option<String>> {
        Box::pin(async move {
            let reply = self.is_master().await?;
            Ok(reply.get_str("setName").ok().map(str::to_string))
        })
    }

    fn list_shards(&self) -> SourceFuture<'_, Vec<(String, String)>> {
        Box::pin(async move {
            let shards: Collection<Document> = self.client.database("config").collection("shards");
            let docs: Vec<Document> = shards
                .find(None, None)
                .await
                .map_err(|e| mongo_error("list_shards", e))?
                .try_collect()
                .await
                .map_err(|e| mongo_error("list_shards", e))?;

            docs.iter()
                .map(|d| {
                    let id = d.get_str("_id").map_err(|_| {
                        ConnectorError::mongo("list_shards", format!("shard without _id: {}", d))
                    })?;
                    let host = d.get_str("host").map_err(|_| {
                        ConnectorError::mongo("list_shards", format!("shard {} without host", id))
                    })?;
                    Ok((id.to_string(), host.to_string()))
                })
                .collect()
        })
    }

    fn connect_main(&self, replica_set_name: String) -> SourceFuture<'_, Arc<dyn OplogSource>> {
        Box::pin(async move {
            let source = MongoReplicaSet::new(replica_set_name, self.options.clone())?;
            Ok(Arc::new(source) as Arc<dyn OplogSource>)
        })
    }

    fn connect_shard<'a>(&'a self, shard: &'a ShardDescriptor) -> SourceFuture<'a, Arc<dyn OplogSource>> {
        Box::pin(async move {
            let mut options = self.options.clone();
            options.hosts = shard
                .hosts
                .iter()
                .map(|h| ServerAddress::parse(h))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| mongo_error("connect_shard", e))?;
            options.repl_set_name = Some(shard.replica_set_name.clone());
            options.direct_connection = None;

            let source = MongoReplicaSet::new(shard.replica_set_name.clone(), options)?;
            info!(shard = %shard.shard_id, replica_set = %shard.replica_set_name, "Connected to shard");
            Ok(Arc::new(source) as Arc<dyn OplogSource>)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replica set
// ═══════════════════════════════════════════════════════════════════════════════

/// One replica set's oplog and data.
pub struct MongoReplicaSet {
    name: String,
    options: ClientOptions,
    client: RwLock<Client>,
}

impl MongoReplicaSet {
    pub fn new(name: String, options: ClientOptions) -> Result<Self> {
        let client = Client::with_options(options.clone()).map_err(|e| mongo_error("connect", e))?;
        Ok(Self {
            name,
            options,
            client: RwLock::new(client),
        })
    }

    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    async fn oplog(&self) -> Collection<Document> {
        self.client()
            .await
            .database(OPLOG_DATABASE)
            .collection(OPLOG_COLLECTION)
    }

    /// Entries at or after `from` in allowed namespaces. The entry exactly at
    /// `from` always matches, so a checkpoint taken on an entry outside the
    /// allow-list (the oplog top after a dump) still anchors the cursor.
    fn oplog_filter(from: OplogTimestamp, filter: &NamespaceFilter) -> Document {
        let from = Timestamp::from(from);
        let mut query = doc! { "ts": { "$gte": from } };
        if let Some(regex) = filter.to_regex() {
            query.insert(
                "$or",
                vec![doc! { "ts": from }, doc! { "ns": { "$regex": regex } }],
            );
        }
        query
    }

    async fn newest_entry(&self, query: Option<Document>, operation: &str) -> Result<Option<OplogTimestamp>> {
        let options = FindOneOptions::builder()
            .sort(doc! { "$natural": -1 })
            .projection(doc! { "ts": 1 })
            .build();
        let entry = self
            .oplog()
            .await
            .find_one(query, options)
            .await
            .map_err(|e| mongo_error(operation, e))?;
        Ok(entry
            .and_then(|d| d.get_timestamp("ts").ok())
            .map(OplogTimestamp::from))
    }
}

impl OplogSource for MongoReplicaSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn oplog_top(&self) -> SourceFuture<'_, Option<OplogTimestamp>> {
        Box::pin(async move { self.newest_entry(None, "oplog_top").await })
    }

    fn count_entries<'a>(&'a self, from: OplogTimestamp, filter: &'a NamespaceFilter) -> SourceFuture<'a, u64> {
        Box::pin(async move {
            self.oplog()
                .await
                .count_documents(Self::oplog_filter(from, filter), None)
                .await
                .map_err(|e| mongo_error("count_entries", e))
        })
    }

    fn tail<'a>(&'a self, from: OplogTimestamp, filter: &'a NamespaceFilter) -> SourceFuture<'a, OplogStream> {
        Box::pin(async move {
            let options = FindOptions::builder()
                .cursor_type(CursorType::TailableAwait)
                .no_cursor_timeout(true)
                .build();
            let cursor = self
                .oplog()
                .await
                .find(Self::oplog_filter(from, filter), options)
                .await
                .map_err(|e| mongo_error("tail", e))?;
            debug!(replica_set = %self.name, from = %from, "Opened tailing cursor");

            let stream = cursor.map(|next| {
                next.map_err(|e| mongo_error("tail", e))
                    .and_then(|doc| OplogEntry::from_document(&doc))
            });
            Ok(stream.boxed())
        })
    }

    fn entry_at_or_before(&self, at: OplogTimestamp) -> SourceFuture<'_, Option<OplogTimestamp>> {
        Box::pin(async move {
            let query = doc! { "ts": { "$lte": Timestamp::from(at) } };
            self.newest_entry(Some(query), "entry_at_or_before").await
        })
    }

    fn find_documents<'a>(
        &'a self,
        ns: &'a str,
        key_field: &'a str,
        ids: Vec<Bson>,
    ) -> SourceFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let (db, coll) = split_namespace(ns)?;
            let collection: Collection<Document> = self.client().await.database(db).collection(coll);
            collection
                .find(doc! { key_field: { "$in": ids } }, None)
                .await
                .map_err(|e| mongo_error("find_documents", e))?
                .try_collect()
                .await
                .map_err(|e| mongo_error("find_documents", e))
        })
    }

    fn list_namespaces(&self) -> SourceFuture<'_, Vec<String>> {
        Box::pin(async move {
            let client = self.client().await;
            let databases = client
                .list_database_names(None, None)
                .await
                .map_err(|e| mongo_error("list_databases", e))?;

            let mut namespaces = Vec::new();
            for db in databases {
                let collections = client
                    .database(&db)
                    .list_collection_names(None)
                    .await
                    .map_err(|e| mongo_error("list_collections", e))?;
                namespaces.extend(
                    collections
                        .into_iter()
                        .map(|c| format!("{}.{}", db, c))
                        .filter(|ns| !is_internal_namespace(ns)),
                );
            }
            namespaces.sort();
            Ok(namespaces)
        })
    }

    fn dump_collection<'a>(&'a self, ns: &'a str) -> SourceFuture<'a, DocumentStream> {
        Box::pin(async move {
            let (db, coll) = split_namespace(ns)?;
            let collection: Collection<Document> = self.client().await.database(db).collection(coll);
            let cursor = collection
                .find(None, None)
                .await
                .map_err(|e| mongo_error("dump_collection", e))?;
            Ok(cursor.map_err(|e| mongo_error("dump_collection", e)).boxed())
        })
    }

    fn reconnect(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            let client = Client::with_options(self.options.clone()).map_err(|e| mongo_error("reconnect", e))?;
            client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
                .map_err(|e| mongo_error("reconnect", e))?;
            *self.client.write().await = client;
            info!(replica_set = %self.name, "Reconnected");
            Ok(())
        })
    }
}
