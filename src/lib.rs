//! # Oplog Connector
//!
//! Change data capture from MongoDB: tails the replication oplog of a
//! replica set (or of every shard of a sharded cluster) and replays each
//! insert, update and delete into one or more pluggable targets.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            oplog-connector                                │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ Connector   │───►│ OplogTailer  │───►│ Filter + remap + dispatch to │  │
//! │  │ (topology)  │    │ (per shard)  │    │ every ReplicationTarget      │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │         │                  │                                              │
//! │         ▼                  ▼                                              │
//! │  ┌─────────────────┐  ┌──────────────────────────┐                        │
//! │  │ CheckpointStore │  │ Dump / Rollback          │                        │
//! │  │ (JSON file)     │  │ (initial copy, recovery) │                        │
//! │  └─────────────────┘  └──────────────────────────┘                        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once: after a crash or reconnect, entries applied
//! after the last persisted checkpoint are applied again.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oplog_connector::{Connector, ConnectorConfig, TargetRegistry};
//!
//! #[tokio::main]
//! async fn main() -> oplog_connector::Result<()> {
//!     let config = ConnectorConfig::default();
//!     let registry = TargetRegistry::new();
//!
//!     let mut connector = Connector::connect(config, &registry).await?;
//!     let shutdown = connector.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     connector.run().await
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod mongo;
pub mod namespace;
pub mod oplog;
pub mod resilience;
pub mod source;
pub mod tailer;
pub mod target;
pub mod timestamp;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use config::{
    AuthConfig, CheckpointConfig, ConnectorConfig, FieldsConfig, NamespaceConfig, SupervisorConfig,
    TailerConfig, TargetConfig,
};
pub use coordinator::{Connector, ConnectorState, ShutdownHandle, TailerState, Topology};
pub use error::{ConnectorError, Result};
pub use filter::{FieldFilter, FieldSelection};
pub use mongo::{MongoCluster, MongoReplicaSet};
pub use namespace::NamespaceFilter;
pub use oplog::{OplogEntry, OplogOp};
pub use source::{ClusterClient, OplogSource, ShardDescriptor};
pub use tailer::{OplogTailer, Position, RollbackOutcome, TailerSettings};
pub use target::{BulkUpsert, ReplicatedDocument, ReplicationTarget, TargetError, TargetRegistry};
pub use timestamp::OplogTimestamp;
