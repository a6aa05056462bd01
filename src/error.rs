// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the oplog connector.
//!
//! Errors are categorized by their source (the MongoDB driver, a replication
//! target, the checkpoint file) and by whether the owning tailer can recover
//! from them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Source` | Yes | Network errors, operation failures, server selection |
//! | `Target` | Depends | Target write/commit failure (connection errors retry) |
//! | `Checkpoint` | No | Checkpoint file I/O (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `NotReplicaSet` | No | Entry point or shard is not a replica set |
//! | `FellBehind` | No | Oplog retention passed our checkpoint |
//! | `CheckpointMismatch` | No | Checkpoint disagrees with the oplog contents |
//! | `DumpFailed` | No | Initial collection dump failed |
//! | `MalformedEntry` | No | Oplog document with unexpected shape |
//! | `TailerStopped` | No | A tailer exited, the supervisor fails fast |
//! | `InvalidState` | No | Lifecycle misuse |
//! | `Shutdown` | No | Cancelled |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The tailer turns retryable errors into a reconnect cycle. Everything else
//! stops the tailer, and a stopped tailer stops the whole connector.

use crate::target::TargetError;
use crate::timestamp::OplogTimestamp;
use thiserror::Error;

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors that can occur while replicating.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// MongoDB driver or command error.
    ///
    /// Covers dropped connections, primary step-downs, server selection
    /// timeouts and failed commands. Retryable.
    #[error("Source error ({operation}): {message}")]
    Source { operation: String, message: String },

    /// A replication target rejected or failed an operation.
    #[error("Target error ({target}): {source}")]
    Target {
        target: String,
        #[source]
        source: TargetError,
    },

    /// Checkpoint file I/O failure.
    #[error("Checkpoint file error: {0}")]
    Checkpoint(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The entry point (or one of its shards) is not a configured replica set.
    #[error("Not a replica set: {0}")]
    NotReplicaSet(String),

    /// The oplog no longer contains our checkpoint: its oldest entry is newer.
    ///
    /// Nothing can be replayed from here, the tailer must stop.
    #[error("Fell behind oplog retention: checkpoint {requested}, oldest available {oldest}")]
    FellBehind {
        requested: OplogTimestamp,
        oldest: OplogTimestamp,
    },

    /// The first entry at the checkpoint position is not the checkpoint itself.
    #[error("Checkpoint {checkpoint} disagrees with oplog entry {found}")]
    CheckpointMismatch {
        checkpoint: OplogTimestamp,
        found: OplogTimestamp,
    },

    /// The initial collection dump did not complete.
    #[error("Collection dump failed: {0}")]
    DumpFailed(String),

    /// Oplog document could not be parsed.
    #[error("Malformed oplog entry: {0}")]
    MalformedEntry(String),

    /// A tailer exited while the connector was running.
    #[error("Tailer stopped: {0}")]
    TailerStopped(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Create a source error from a driver error (or anything displayable).
    pub fn mongo(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Source {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Create a target error.
    pub fn target(target: impl Into<String>, source: TargetError) -> Self {
        Self::Target {
            target: target.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { .. } => true,
            Self::Target { source, .. } => source.is_retryable(),
            Self::Checkpoint(_) => false,
            Self::Config(_) => false,
            Self::NotReplicaSet(_) => false,
            Self::FellBehind { .. } => false,
            Self::CheckpointMismatch { .. } => false,
            Self::DumpFailed(_) => false,
            Self::MalformedEntry(_) => false,
            Self::TailerStopped(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<mongodb::error::Error> for ConnectorError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::mongo("unknown", e)
    }
}
