// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster supervisor.
//!
//! The main orchestrator that ties together:
//! - Topology discovery via [`ClusterClient`]
//! - One [`OplogTailer`] task per replica set
//! - Checkpoint persistence via [`CheckpointStore`]
//! - Replication targets resolved from a [`TargetRegistry`]
//!
//! # Architecture
//!
//! [`Connector::start`] opens the checkpoint file, probes the entry point and
//! spawns the first tailer(s). [`Connector::run`] then loops once per
//! `poll_interval`:
//! 1. Fail fast if any tailer task has finished
//! 2. Persist checkpoints
//! 3. In sharded mode, start a tailer for every shard not seen before
//!
//! Shards are never removed once added.
//!
//! # Fail Fast
//!
//! A tailer that exits while the connector is running takes the whole
//! connector down: shutdown is signalled, every target is stopped, every
//! tailer is joined (bounded by `shutdown_timeout`), checkpoints are
//! persisted, and `run` returns the tailer's error.

mod topology;
mod types;

pub use topology::{discover, list_shards, Topology};
pub use types::{ConnectorState, TailerState};

use crate::checkpoint::CheckpointStore;
use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, Result};
use crate::metrics;
use crate::mongo::MongoCluster;
use crate::resilience::{retry_until_ok, RetryConfig};
use crate::source::{ClusterClient, OplogSource, ShardDescriptor};
use crate::tailer::{wait_for_shutdown, OplogTailer, TailerSettings};
use crate::target::{ReplicationTarget, TargetRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A running tailer, owned by the supervisor.
struct TailerHandle {
    replica_set: String,
    state: watch::Receiver<TailerState>,
    task: JoinHandle<Result<()>>,
}

/// Cloneable trigger for a graceful shutdown of a running [`Connector`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// The oplog connector.
///
/// Only the supervisor (this struct) adds to or removes from the tailer map.
pub struct Connector {
    config: ConnectorConfig,
    settings: TailerSettings,
    retry: RetryConfig,
    client: Arc<dyn ClusterClient>,
    targets: Vec<Arc<dyn ReplicationTarget>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    state_tx: watch::Sender<ConnectorState>,
    state_rx: watch::Receiver<ConnectorState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    topology: Option<Topology>,
    tailers: HashMap<String, TailerHandle>,
}

impl Connector {
    /// Connect to MongoDB and build the configured targets.
    pub async fn connect(config: ConnectorConfig, registry: &TargetRegistry) -> Result<Self> {
        config.validate()?;
        let targets = registry.build_all(&config.targets)?;
        let client = MongoCluster::connect(&config).await?;
        Self::new(config, Arc::new(client), targets)
    }

    /// Create a connector over an existing cluster client and targets.
    ///
    /// The connector starts in `Created` state; call [`run()`](Self::run).
    pub fn new(
        config: ConnectorConfig,
        client: Arc<dyn ClusterClient>,
        targets: Vec<Arc<dyn ReplicationTarget>>,
    ) -> Result<Self> {
        config.validate()?;
        let settings = TailerSettings::from_config(&config)?;
        if targets.is_empty() {
            warn!("No replication targets configured, entries will only be checkpointed");
        }

        let (state_tx, state_rx) = watch::channel(ConnectorState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            retry: settings.retry.clone(),
            settings,
            client,
            targets,
            checkpoints: None,
            state_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            topology: None,
            tailers: HashMap::new(),
        })
    }

    /// Override tailer settings (timings, retry policy). Filters are kept
    /// from the config.
    pub fn with_tailer_settings(mut self, settings: TailerSettings) -> Self {
        self.retry = settings.retry.clone();
        self.settings = TailerSettings {
            namespaces: self.settings.namespaces.clone(),
            fields: self.settings.fields.clone(),
            ..settings
        };
        self
    }

    pub fn state(&self) -> ConnectorState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ConnectorState::Running)
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Shard ids with a tailer, sorted.
    pub fn shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tailers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state of every tailer, keyed by replica set name.
    pub fn tailer_states(&self) -> HashMap<String, TailerState> {
        self.tailers
            .values()
            .map(|t| (t.replica_set.clone(), *t.state.borrow()))
            .collect()
    }

    /// The checkpoint store, once started.
    pub fn checkpoints(&self) -> Option<&Arc<CheckpointStore>> {
        self.checkpoints.as_ref()
    }

    fn set_state(&self, state: ConnectorState) {
        self.state_tx.send_replace(state);
        metrics::set_connector_state(&state.to_string());
    }

    /// Open checkpoints, discover topology and start the first tailers.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ConnectorState::Created {
            return Err(ConnectorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            address = %self.config.main_address,
            targets = self.targets.len(),
            "Starting oplog connector"
        );
        self.set_state(ConnectorState::Connecting);

        match self.start_inner().await {
            Ok(()) => {
                self.set_state(ConnectorState::Running);
                info!(tailers = self.tailers.len(), "Oplog connector running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start oplog connector");
                self.teardown(true).await;
                self.set_state(ConnectorState::Failed);
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<()> {
        let store = CheckpointStore::open(&self.config.checkpoint.path).await?;
        self.checkpoints = Some(Arc::new(store));

        let topology = discover(self.client.as_ref(), &self.retry).await?;
        info!(topology = ?topology, "Discovered topology");
        self.topology = Some(topology.clone());

        match topology {
            Topology::ReplicaSet(name) => {
                let client = Arc::clone(&self.client);
                let source = retry_until_ok(&self.retry, "connect_main", || {
                    client.connect_main(name.clone())
                })
                .await?;
                self.spawn_tailer(name, source)?;
            }
            Topology::Sharded => self.add_new_shards().await?,
        }
        Ok(())
    }

    /// Start a tailer for every shard not yet known.
    async fn add_new_shards(&mut self) -> Result<()> {
        let shards = list_shards(self.client.as_ref(), &self.retry).await?;
        for shard in shards {
            if self.tailers.contains_key(&shard.shard_id) {
                continue;
            }
            let source = self.connect_shard(&shard).await?;
            info!(shard = %shard.shard_id, replica_set = %shard.replica_set_name, "New shard discovered");
            self.spawn_tailer(shard.shard_id.clone(), source)?;
        }
        Ok(())
    }

    async fn connect_shard(&self, shard: &ShardDescriptor) -> Result<Arc<dyn OplogSource>> {
        let client = Arc::clone(&self.client);
        retry_until_ok(&self.retry, "connect_shard", || client.connect_shard(shard)).await
    }

    fn spawn_tailer(&mut self, shard_id: String, source: Arc<dyn OplogSource>) -> Result<()> {
        let checkpoints = self
            .checkpoints
            .clone()
            .ok_or_else(|| ConnectorError::Internal("checkpoint store not open".to_string()))?;

        let tailer = OplogTailer::new(
            source,
            self.targets.clone(),
            checkpoints,
            self.settings.clone(),
            self.shutdown_rx.clone(),
        );
        let replica_set = tailer.key().to_string();
        let state = tailer.state_receiver();
        let task = tokio::spawn(tailer.run());

        debug!(shard = %shard_id, replica_set = %replica_set, "Spawned oplog tailer");
        self.tailers.insert(
            shard_id,
            TailerHandle {
                replica_set,
                state,
                task,
            },
        );
        metrics::set_active_tailers(self.tailers.len());
        Ok(())
    }

    /// Start (if needed) and supervise until shutdown or a tailer failure.
    pub async fn run(&mut self) -> Result<()> {
        if self.state() == ConnectorState::Created {
            self.start().await?;
        }
        if self.state() != ConnectorState::Running {
            return Err(ConnectorError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.config.supervisor.poll_interval_duration());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    self.shutdown().await;
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if let Some(e) = self.reap_finished_tailer().await {
                return Err(self.fail(e).await);
            }

            self.persist_checkpoints().await;

            if matches!(self.topology, Some(Topology::Sharded)) {
                if let Err(e) = self.add_new_shards().await {
                    return Err(self.fail(e).await);
                }
            }
        }
    }

    /// Remove the first finished tailer from the map and turn its exit into an error.
    async fn reap_finished_tailer(&mut self) -> Option<ConnectorError> {
        let shard_id = self
            .tailers
            .iter()
            .find(|(_, t)| t.task.is_finished())
            .map(|(id, _)| id.clone())?;
        let tailer = self.tailers.remove(&shard_id)?;
        metrics::set_active_tailers(self.tailers.len());

        let error = match tailer.task.await {
            Ok(Ok(())) => ConnectorError::TailerStopped(format!("tailer for shard {} exited", shard_id)),
            Ok(Err(e)) => e,
            Err(join_error) => {
                ConnectorError::TailerStopped(format!("tailer for shard {} panicked: {}", shard_id, join_error))
            }
        };
        error!(shard = %shard_id, error = %error, "Tailer stopped, shutting down connector");
        Some(error)
    }

    /// Fail-fast sequence. Returns the error to surface.
    async fn fail(&mut self, error: ConnectorError) -> ConnectorError {
        self.set_state(ConnectorState::ShuttingDown);
        self.teardown(true).await;
        self.set_state(ConnectorState::Failed);
        error
    }

    /// Shut down gracefully: cancel tailers, let them checkpoint, then stop targets.
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), ConnectorState::Stopped | ConnectorState::Failed) {
            return;
        }
        info!("Shutting down oplog connector");
        self.set_state(ConnectorState::ShuttingDown);
        self.teardown(false).await;
        self.set_state(ConnectorState::Stopped);
        info!("Oplog connector stopped");
    }

    /// Signal cancellation, stop targets, join tailers and persist.
    ///
    /// On failure targets are stopped before the join so a wedged target
    /// call cannot hold the connector up; on a graceful shutdown they are
    /// stopped after it.
    async fn teardown(&mut self, stop_targets_first: bool) {
        self.shutdown_tx.send_replace(true);

        if stop_targets_first {
            self.stop_targets().await;
        }
        self.join_tailers(self.config.supervisor.shutdown_timeout_duration()).await;
        if !stop_targets_first {
            self.stop_targets().await;
        }

        self.persist_checkpoints().await;
    }

    async fn stop_targets(&self) {
        for target in &self.targets {
            if let Err(e) = target.stop().await {
                warn!(target = target.name(), error = %e, "Target failed to stop cleanly");
            }
        }
    }

    async fn join_tailers(&mut self, timeout: Duration) {
        let tailers: Vec<(String, TailerHandle)> = self.tailers.drain().collect();
        metrics::set_active_tailers(0);
        if !tailers.is_empty() {
            info!(count = tailers.len(), "Waiting for tailers to finish");
        }

        for (shard_id, tailer) in tailers {
            let mut task = tailer.task;
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(Ok(()))) => debug!(shard = %shard_id, "Tailer finished"),
                Ok(Ok(Err(e))) => warn!(shard = %shard_id, error = %e, "Tailer finished with error"),
                Ok(Err(e)) => warn!(shard = %shard_id, error = %e, "Tailer panicked"),
                Err(_) => {
                    warn!(shard = %shard_id, "Tailer did not finish in time, aborting");
                    task.abort();
                }
            }
        }
    }

    /// Write checkpoints to disk; failures keep the previous file.
    pub async fn persist_checkpoints(&self) {
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.persist().await {
                warn!(error = %e, "Failed to persist checkpoints");
            }
        }
    }
}
