//! Cluster topology discovery.
//!
//! The entry point is either a replica set member or a `mongos` router. A
//! router answers `isMaster` with `msg: "isdbgrid"`; its shards are listed in
//! `config.shards` as `{ _id: "shard0", host: "rs0/h1:27017,h2:27017" }`.
//! Every shard must itself be a replica set, since only replica sets have an
//! oplog.

use crate::error::{ConnectorError, Result};
use crate::resilience::{retry_until_ok, RetryConfig};
use crate::source::{ClusterClient, ShardDescriptor};

/// Deployment shape behind the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// A single replica set with this name.
    ReplicaSet(String),
    /// A sharded cluster behind a router.
    Sharded,
}

impl ShardDescriptor {
    /// Parse a `config.shards` entry. The host string must carry a
    /// `replicaSet/` prefix.
    pub fn parse(shard_id: &str, host: &str) -> Result<Self> {
        let (set, hosts) = host.split_once('/').ok_or_else(|| {
            ConnectorError::NotReplicaSet(format!(
                "shard {} ({}) is not a replica set",
                shard_id, host
            ))
        })?;
        if set.is_empty() {
            return Err(ConnectorError::NotReplicaSet(format!(
                "shard {} has an empty replica set name",
                shard_id
            )));
        }

        let hosts: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err(ConnectorError::Config(format!("shard {} lists no hosts", shard_id)));
        }

        Ok(Self {
            shard_id: shard_id.to_string(),
            replica_set_name: set.to_string(),
            hosts,
        })
    }
}

/// Probe the entry point. A standalone node is refused.
pub async fn discover(client: &dyn ClusterClient, retry: &RetryConfig) -> Result<Topology> {
    if retry_until_ok(retry, "is_sharded", || client.is_sharded()).await? {
        return Ok(Topology::Sharded);
    }
    match retry_until_ok(retry, "replica_set_name", || client.replica_set_name()).await? {
        Some(name) => Ok(Topology::ReplicaSet(name)),
        None => Err(ConnectorError::NotReplicaSet(
            "entry point is a standalone node; oplog tailing needs a replica set".to_string(),
        )),
    }
}

/// Current shard list, parsed.
pub async fn list_shards(client: &dyn ClusterClient, retry: &RetryConfig) -> Result<Vec<ShardDescriptor>> {
    let raw = retry_until_ok(retry, "list_shards", || client.list_shards()).await?;
    raw.iter()
        .map(|(id, host)| ShardDescriptor::parse(id, host))
        .collect()
}
