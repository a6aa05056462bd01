// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for oplog positions.
//!
//! Stores the last applied oplog timestamp for each shard (keyed by replica
//! set name) in a small JSON file.
//!
//! # File Format
//!
//! A flat array of alternating keys and stringified packed timestamps:
//!
//! ```text
//! ["rs0", "7318349394477056001", "rs1", "7318349394477056007"]
//! ```
//!
//! Keys are written sorted. Numeric timestamps are accepted when reading.
//! An empty, missing or unparsable file loads as "no checkpoints", which
//! makes every tailer start with a full resync.
//!
//! # Atomic Writes
//!
//! ```text
//! serialize → write <path>.tmp → rename <path> → <path>.backup
//!           → rename <path>.tmp → <path> → delete <path>.backup
//! ```
//!
//! A failed temp write leaves the current file untouched. A failed install
//! moves the backup back. A backup left behind by a crash is restored by
//! [`CheckpointStore::open`] when the current file is missing.
//!
//! ## Locking
//!
//! The whole map sits behind one async mutex. [`persist`](CheckpointStore::persist)
//! holds it across the write sequence, so no tailer update lands between
//! serialization and install.

use crate::error::{ConnectorError, Result};
use crate::metrics;
use crate::timestamp::OplogTimestamp;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Scoped access to the checkpoint map.
pub type CheckpointGuard<'a> = MutexGuard<'a, HashMap<String, u64>>;

/// Shared map of shard key → last applied timestamp, backed by a file.
pub struct CheckpointStore {
    path: PathBuf,
    checkpoints: Mutex<HashMap<String, u64>>,
}

impl CheckpointStore {
    /// Open the checkpoint file, creating it if needed, and load its contents.
    ///
    /// Failure to create the file is returned as [`ConnectorError::Checkpoint`].
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let backup = sibling(&path, "backup");

        if !exists(&path).await? && exists(&backup).await? {
            warn!(path = %path.display(), "Checkpoint file missing, restoring from backup");
            fs::rename(&backup, &path).await?;
        }

        // Touch the file so an unwritable location fails here, not later.
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let checkpoints = Self::load(&path).await;
        info!(path = %path.display(), shards = checkpoints.len(), "Checkpoint store opened");

        Ok(Self {
            path,
            checkpoints: Mutex::new(checkpoints),
        })
    }

    /// Read and parse a checkpoint file. Never fails: anything unreadable
    /// loads as empty.
    pub async fn load(path: &Path) -> HashMap<String, u64> {
        match fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => match parse(&content) {
                Ok(map) => map,
                Err(reason) => {
                    warn!(path = %path.display(), reason, "Malformed checkpoint file, starting without checkpoints");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read checkpoint file, starting without checkpoints");
                HashMap::new()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the map for a read-modify-write.
    pub async fn lock(&self) -> CheckpointGuard<'_> {
        self.checkpoints.lock().await
    }

    pub async fn get(&self, key: &str) -> Option<OplogTimestamp> {
        self.lock().await.get(key).copied().map(OplogTimestamp::from_u64)
    }

    pub async fn set(&self, key: &str, ts: OplogTimestamp) {
        self.lock().await.insert(key.to_string(), ts.as_u64());
    }

    /// Copy of the whole map.
    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.lock().await.clone()
    }

    /// Write the map to disk.
    pub async fn persist(&self) -> Result<()> {
        self.persist_with(|tmp, bytes| async move { fs::write(tmp, bytes).await })
            .await
    }

    /// Write the map to disk, using `write_temp` to produce the temp file.
    pub async fn persist_with<F, Fut>(&self, write_temp: F) -> Result<()>
    where
        F: FnOnce(PathBuf, Vec<u8>) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let guard = self.lock().await;
        let bytes = serialize(&guard);
        let tmp = sibling(&self.path, "tmp");
        let backup = sibling(&self.path, "backup");

        if let Err(e) = write_temp(tmp.clone(), bytes).await {
            let _ = fs::remove_file(&tmp).await;
            metrics::record_checkpoint_persist(false);
            warn!(path = %self.path.display(), error = %e, "Checkpoint write failed, previous file kept");
            return Err(ConnectorError::Checkpoint(e));
        }

        let had_current = exists(&self.path).await?;
        if had_current {
            fs::rename(&self.path, &backup).await?;
        }

        if let Err(e) = fs::rename(&tmp, &self.path).await {
            if had_current {
                if let Err(restore_err) = fs::rename(&backup, &self.path).await {
                    warn!(error = %restore_err, "Failed to restore checkpoint backup");
                }
            }
            let _ = fs::remove_file(&tmp).await;
            metrics::record_checkpoint_persist(false);
            warn!(path = %self.path.display(), error = %e, "Checkpoint install failed, backup restored");
            return Err(ConnectorError::Checkpoint(e));
        }

        if had_current {
            if let Err(e) = fs::remove_file(&backup).await {
                debug!(error = %e, "Could not delete checkpoint backup");
            }
        }

        metrics::record_checkpoint_persist(true);
        debug!(path = %self.path.display(), shards = guard.len(), "Checkpoints persisted");
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

async fn exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn serialize(map: &HashMap<String, u64>) -> Vec<u8> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let flat: Vec<Value> = keys
        .into_iter()
        .flat_map(|k| [Value::String(k.clone()), Value::String(map[k].to_string())])
        .collect();
    Value::Array(flat).to_string().into_bytes()
}

/// Parse the flat `[key, ts, ...]` form.
pub fn parse(content: &str) -> std::result::Result<HashMap<String, u64>, String> {
    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let items = value.as_array().ok_or("not a JSON array")?;
    if items.len() % 2 != 0 {
        return Err(format!("odd number of elements ({})", items.len()));
    }

    let mut map = HashMap::with_capacity(items.len() / 2);
    for pair in items.chunks_exact(2) {
        let key = pair[0].as_str().ok_or("checkpoint key is not a string")?;
        let ts = match &pair[1] {
            Value::String(s) => s
                .parse::<u64>()
                .map_err(|e| format!("timestamp for {:?}: {}", key, e))?,
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| format!("timestamp for {:?} is not an unsigned integer", key))?,
            _ => return Err(format!("timestamp for {:?} has wrong type", key)),
        };
        map.insert(key.to_string(), ts);
    }
    Ok(map)
}
