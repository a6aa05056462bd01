//! Configuration for the oplog connector.
//!
//! Configuration is passed to [`Connector::new()`](crate::Connector::new) and
//! can be constructed programmatically or deserialized from YAML/JSON by the
//! embedding binary. Command-line parsing is not this crate's concern.
//!
//! # Quick Start
//!
//! ```rust
//! use oplog_connector::config::{ConnectorConfig, TargetConfig};
//!
//! let config = ConnectorConfig {
//!     main_address: "mongodb://localhost:27017".into(),
//!     targets: vec![TargetConfig::new("search")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ConnectorConfig
//! ├── main_address: String          # mongod or mongos entry point
//! ├── auth: Option<AuthConfig>      # credentials, re-used on reconnect
//! ├── namespaces: NamespaceConfig   # allow-list + remapping
//! ├── fields: FieldsConfig          # top-level include or exclude list
//! ├── unique_key: String            # target-side id field, default "_id"
//! ├── collection_dump: bool         # full dump when no checkpoint exists
//! ├── continue_on_error: bool       # skip failing documents during dump
//! ├── checkpoint: CheckpointConfig  # file path + cadence
//! ├── tailer: TailerConfig          # reconnect/idle timings, dump tuning
//! ├── supervisor: SupervisorConfig  # topology poll, shutdown timeout
//! └── targets: Vec<TargetConfig>    # resolved via TargetRegistry
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! main_address: "mongodb://mongos.internal:27017"
//! namespaces:
//!   include: ["shop.orders", "shop.customers"]
//!   mapping:
//!     shop.orders: "search.orders"
//! fields:
//!   exclude: ["password_hash"]
//! checkpoint:
//!   path: "/var/lib/oplog-connector/checkpoint.json"
//!   checkpoint_every: 1000
//! tailer:
//!   reconnect_delay: "1s"
//! targets:
//!   - kind: "search"
//!     url: "http://search.internal:8983/solr"
//! ```

use crate::error::{ConnectorError, Result};
use crate::filter::{FieldFilter, FieldSelection};
use crate::namespace::NamespaceFilter;
use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Connector::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// MongoDB connection string of the entry point (a replica set member
    /// or a `mongos` router).
    pub main_address: String,

    /// Credentials applied to every connection, including per-shard ones.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub namespaces: NamespaceConfig,

    #[serde(default)]
    pub fields: FieldsConfig,

    /// Target-side field that carries the source `_id`. Always replicated.
    #[serde(default = "default_unique_key")]
    pub unique_key: String,

    /// Dump every in-scope collection when a shard has no checkpoint.
    /// When disabled, replication starts from the current oplog top.
    #[serde(default = "default_true")]
    pub collection_dump: bool,

    /// During the dump, log and skip documents a target rejects instead of
    /// failing the dump.
    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub tailer: TailerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Replication targets, resolved by kind at startup.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_unique_key() -> String {
    "_id".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            main_address: "mongodb://localhost:27017".to_string(),
            auth: None,
            namespaces: NamespaceConfig::default(),
            fields: FieldsConfig::default(),
            unique_key: default_unique_key(),
            collection_dump: true,
            continue_on_error: false,
            checkpoint: CheckpointConfig::default(),
            tailer: TailerConfig::default(),
            supervisor: SupervisorConfig::default(),
            targets: Vec::new(),
        }
    }
}

impl ConnectorConfig {
    /// Create a fast-cadence config for testing.
    pub fn for_testing(checkpoint_path: &str) -> Self {
        Self {
            checkpoint: CheckpointConfig {
                path: checkpoint_path.to_string(),
                checkpoint_every: 1,
            },
            tailer: TailerConfig::for_testing(),
            supervisor: SupervisorConfig::for_testing(),
            ..Default::default()
        }
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.main_address.trim().is_empty() {
            return Err(ConnectorError::Config("main_address must not be empty".into()));
        }
        if self.unique_key.is_empty() {
            return Err(ConnectorError::Config("unique_key must not be empty".into()));
        }
        if !self.fields.include.is_empty() && !self.fields.exclude.is_empty() {
            return Err(ConnectorError::Config(
                "fields.include and fields.exclude are mutually exclusive".into(),
            ));
        }
        if self.checkpoint.path.trim().is_empty() {
            return Err(ConnectorError::Config("checkpoint.path must not be empty".into()));
        }
        if self.tailer.dump_chunk_size == 0 {
            return Err(ConnectorError::Config("tailer.dump_chunk_size must be positive".into()));
        }
        for (name, value) in [
            ("tailer.reconnect_delay", &self.tailer.reconnect_delay),
            ("tailer.idle_interval", &self.tailer.idle_interval),
            ("supervisor.poll_interval", &self.supervisor.poll_interval),
            ("supervisor.shutdown_timeout", &self.supervisor.shutdown_timeout),
        ] {
            humantime::parse_duration(value)
                .map_err(|e| ConnectorError::Config(format!("{}: {:?}: {}", name, value, e)))?;
        }
        self.namespace_filter()?;
        Ok(())
    }

    /// Build the namespace filter.
    pub fn namespace_filter(&self) -> Result<NamespaceFilter> {
        NamespaceFilter::new(&self.namespaces.include, &self.namespaces.mapping)
    }

    /// Build the field filter.
    pub fn field_filter(&self) -> FieldFilter {
        FieldFilter::new(self.fields.selection(), self.unique_key.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Auth, namespaces, fields
// ═══════════════════════════════════════════════════════════════════════════════

/// Credentials for the source cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    /// Authentication database.
    #[serde(default = "default_auth_source")]
    pub source: String,
}

fn default_auth_source() -> String {
    "admin".to_string()
}

/// Namespace allow-list and remapping table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// `db.collection` patterns to replicate; empty means everything.
    #[serde(default)]
    pub include: Vec<String>,

    /// Source → destination namespace patterns.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

/// Top-level field allow/deny lists. At most one may be non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldsConfig {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

impl FieldsConfig {
    pub fn selection(&self) -> FieldSelection {
        if !self.include.is_empty() {
            FieldSelection::Include(self.include.iter().cloned().collect())
        } else if !self.exclude.is_empty() {
            FieldSelection::Exclude(self.exclude.iter().cloned().collect())
        } else {
            FieldSelection::All
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkpoints
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path of the JSON checkpoint file.
    #[serde(default = "default_checkpoint_path")]
    pub path: String,

    /// Checkpoint after every this many applied entries.
    ///
    /// `0` checkpoints only at cursor batch boundaries; `1` after every entry.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
}

fn default_checkpoint_path() -> String {
    "oplog.timestamp".to_string()
}

fn default_checkpoint_every() -> u64 {
    0
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tailer
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-shard tailer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailerConfig {
    /// Sleep between a lost connection and the next positioning attempt.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: String,

    /// Quiet period on the oplog cursor treated as a batch boundary
    /// (checkpoint + cancellation check). Also the wait when caught up.
    #[serde(default = "default_idle_interval")]
    pub idle_interval: String,

    /// Documents per `bulk_upsert` call during the dump.
    #[serde(default = "default_dump_chunk_size")]
    pub dump_chunk_size: usize,

    /// Optional cap on dumped documents per second.
    #[serde(default)]
    pub dump_rate_limit: Option<u32>,
}

fn default_reconnect_delay() -> String {
    "1s".to_string()
}

fn default_idle_interval() -> String {
    "1s".to_string()
}

fn default_dump_chunk_size() -> usize {
    1000
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: default_reconnect_delay(),
            idle_interval: default_idle_interval(),
            dump_chunk_size: default_dump_chunk_size(),
            dump_rate_limit: None,
        }
    }
}

impl TailerConfig {
    pub fn for_testing() -> Self {
        Self {
            reconnect_delay: "10ms".to_string(),
            idle_interval: "20ms".to_string(),
            dump_chunk_size: 2,
            dump_rate_limit: None,
        }
    }

    pub fn reconnect_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.reconnect_delay).unwrap_or(Duration::from_secs(1))
    }

    pub fn idle_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_interval).unwrap_or(Duration::from_secs(1))
    }

    /// Rate limit for the dump, if configured.
    pub fn dump_rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.dump_rate_limit.map(RateLimitConfig::per_second)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Supervisor
// ═══════════════════════════════════════════════════════════════════════════════

/// Cluster supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Cadence of the liveness check, checkpoint persistence and shard poll.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Bound on waiting for each tailer to finish during shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_interval: "20ms".to_string(),
            shutdown_timeout: "1s".to_string(),
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Targets
// ═══════════════════════════════════════════════════════════════════════════════

/// One replication target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// Registry key of the backend implementation.
    pub kind: String,

    /// Backend address, if it has one.
    #[serde(default)]
    pub url: Option<String>,

    /// Backend-specific options, passed through untouched.
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl TargetConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            url: None,
            options: HashMap::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ConnectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.unique_key, "_id");
        assert!(config.collection_dump);
        assert_eq!(config.checkpoint.checkpoint_every, 0);
    }

    #[test]
    fn test_include_and_exclude_are_exclusive() {
        let mut config = ConnectorConfig::default();
        config.fields.include = vec!["a".into()];
        config.fields.exclude = vec!["b".into()];
        assert!(matches!(config.validate(), Err(ConnectorError::Config(_))));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let mut config = ConnectorConfig::default();
        config.tailer.reconnect_delay = "soon".into();
        match config.validate() {
            Err(ConnectorError::Config(msg)) => assert!(msg.contains("reconnect_delay")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_mapping_rejected() {
        let mut config = ConnectorConfig::default();
        config
            .namespaces
            .mapping
            .insert("db.*".into(), "other.fixed".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_field_selection() {
        let mut fields = FieldsConfig::default();
        assert_eq!(fields.selection(), FieldSelection::All);

        fields.exclude = vec!["secret".into()];
        assert!(matches!(fields.selection(), FieldSelection::Exclude(ref s) if s.contains("secret")));

        fields.include = vec!["a".into()];
        assert!(matches!(fields.selection(), FieldSelection::Include(ref s) if s.contains("a")));
    }

    #[test]
    fn test_durations_parse() {
        let tailer = TailerConfig::default();
        assert_eq!(tailer.reconnect_delay_duration(), Duration::from_secs(1));
        assert_eq!(TailerConfig::for_testing().idle_interval_duration(), Duration::from_millis(20));
        assert_eq!(
            SupervisorConfig::default().shutdown_timeout_duration(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_json_minimal_uses_defaults() {
        let json = r#"{ "main_address": "mongodb://db:27017", "targets": [{ "kind": "search" }] }"#;
        let config: ConnectorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.main_address, "mongodb://db:27017");
        assert_eq!(config.targets, vec![TargetConfig::new("search")]);
        assert_eq!(config.checkpoint.path, "oplog.timestamp");
        assert_eq!(config.supervisor.poll_interval, "1s");
        assert!(config.auth.is_none());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = ConnectorConfig::for_testing("/tmp/cp.json");
        config.auth = Some(AuthConfig {
            username: "repl".into(),
            password: "secret".into(),
            source: "admin".into(),
        });
        config.targets.push(TargetConfig::new("search").with_url("http://s:8983"));

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ConnectorConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.checkpoint.path, "/tmp/cp.json");
        assert_eq!(parsed.checkpoint.checkpoint_every, 1);
        assert_eq!(parsed.auth, config.auth);
        assert_eq!(parsed.targets[0].url.as_deref(), Some("http://s:8983"));
    }

    #[test]
    fn test_dump_rate_limit_config() {
        let mut tailer = TailerConfig::default();
        assert!(tailer.dump_rate_limit_config().is_none());
        tailer.dump_rate_limit = Some(500);
        assert_eq!(tailer.dump_rate_limit_config().unwrap().refill_rate, 500);
    }
}
