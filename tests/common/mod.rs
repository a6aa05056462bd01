//! Shared test utilities for tailer, supervisor, chaos and integration tests.
//!
//! This module provides:
//! - In-memory replica sets and cluster clients
//! - A recording replication target
//! - MongoDB testcontainer setup
//! - Oplog entry and timing helpers

#![allow(dead_code)]

pub mod containers;
pub mod mock_source;
pub mod mock_target;

pub use containers::*;
pub use mock_source::*;
pub use mock_target::*;

use oplog_connector::checkpoint::CheckpointStore;
use oplog_connector::OplogTimestamp;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Shorthand for an oplog timestamp.
pub fn ts(seconds: u32, increment: u32) -> OplogTimestamp {
    OplogTimestamp::new(seconds, increment)
}

/// Poll `check` every 5ms until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A checkpoint store in a fresh temp directory. Keep the directory alive.
pub async fn temp_store() -> (TempDir, Arc<CheckpointStore>) {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::open(dir.path().join("oplog.timestamp"))
        .await
        .unwrap();
    (dir, Arc::new(store))
}
