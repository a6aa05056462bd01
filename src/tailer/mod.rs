// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shard oplog tailer.
//!
//! Each replica set has a dedicated tailer task that:
//! 1. Reads its checkpoint (or dumps every in-scope collection when there is none)
//! 2. Positions a tailing cursor on the checkpointed entry
//! 3. Filters, remaps and dispatches each entry to every target, in order
//! 4. Checkpoints as it goes
//!
//! # Positioning
//!
//! [`OplogTailer::position_cursor`] counts the entries at or after the
//! checkpoint and inspects the first one:
//!
//! | Result | Meaning | Action |
//! |--------|---------|--------|
//! | no entries | checkpoint is past the end of the oplog | rollback |
//! | first entry newer | oplog retention passed the checkpoint | fatal |
//! | first entry differs | checkpoint disagrees with the oplog | fatal |
//! | exactly one entry | nothing new since the checkpoint | wait, retry |
//! | otherwise | | tail, skipping the already-applied first entry |
//!
//! # Checkpoint Cadence
//!
//! The checkpoint only ever names an entry that every target has been sent.
//! It is written every `checkpoint_every` applied entries (`0` disables the
//! count), and always at a batch boundary: an idle gap of `idle_interval` on
//! the cursor, the end of the cursor, or any exit.
//!
//! # Reconnects
//!
//! Retryable source errors move the tailer to `Reconnecting`: the checkpoint
//! is persisted, the source reconnects (re-authenticating), and after
//! `reconnect_delay` the cursor is positioned again at the checkpoint.
//! Entries applied just before the failure may be applied twice.
//!
//! # Document Keys
//!
//! Source documents are always identified by `_id`, the only key oplog
//! updates and deletes carry. Targets receive that value as the document id,
//! stored under the configured `unique_key` field.
//!
//! # Graceful Shutdown
//!
//! Cancellation arrives on a `watch` channel and is raced against every
//! blocking cursor read with `tokio::select!`. A target call already in
//! flight is allowed to finish.

mod dump;
mod rollback;

pub use rollback::RollbackOutcome;

use crate::checkpoint::CheckpointStore;
use crate::config::ConnectorConfig;
use crate::coordinator::TailerState;
use crate::error::{ConnectorError, Result};
use crate::filter::FieldFilter;
use crate::metrics;
use crate::namespace::NamespaceFilter;
use crate::oplog::{OplogEntry, OplogOp, SOURCE_KEY};
use crate::resilience::{retry_until_ok, RateLimitConfig, RetryConfig};
use crate::source::{OplogSource, OplogStream};
use crate::target::{ReplicatedDocument, ReplicationTarget, TargetError};
use crate::timestamp::OplogTimestamp;
use bson::{Bson, Document};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Everything a tailer needs to know besides its source and targets.
#[derive(Debug, Clone)]
pub struct TailerSettings {
    pub namespaces: NamespaceFilter,
    pub fields: FieldFilter,
    pub collection_dump: bool,
    pub continue_on_error: bool,
    pub checkpoint_every: u64,
    pub reconnect_delay: Duration,
    pub idle_interval: Duration,
    pub dump_chunk_size: usize,
    pub dump_rate_limit: Option<RateLimitConfig>,
    /// Retry policy for metadata calls and dump writes.
    pub retry: RetryConfig,
}

impl TailerSettings {
    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        Ok(Self {
            namespaces: config.namespace_filter()?,
            fields: config.field_filter(),
            collection_dump: config.collection_dump,
            continue_on_error: config.continue_on_error,
            checkpoint_every: config.checkpoint.checkpoint_every,
            reconnect_delay: config.tailer.reconnect_delay_duration(),
            idle_interval: config.tailer.idle_interval_duration(),
            dump_chunk_size: config.tailer.dump_chunk_size.max(1),
            dump_rate_limit: config.tailer.dump_rate_limit_config(),
            retry: RetryConfig::metadata(),
        })
    }

    /// Fast timings, checkpoint after every entry.
    pub fn for_testing() -> Self {
        Self {
            namespaces: NamespaceFilter::default(),
            fields: FieldFilter::all("_id"),
            collection_dump: true,
            continue_on_error: false,
            checkpoint_every: 1,
            reconnect_delay: Duration::from_millis(10),
            idle_interval: Duration::from_millis(20),
            dump_chunk_size: 2,
            dump_rate_limit: None,
            retry: RetryConfig::testing(),
        }
    }
}

/// Result of [`OplogTailer::position_cursor`].
pub enum Position {
    /// No entry at or after the checkpoint: roll back.
    AgedOut,
    /// Only the checkpointed entry exists: nothing to do yet.
    CaughtUp,
    /// Cursor positioned after the checkpointed entry.
    Ready(OplogStream),
}

impl Position {
    pub fn label(&self) -> &'static str {
        match self {
            Position::AgedOut => "aged_out",
            Position::CaughtUp => "caught_up",
            Position::Ready(_) => "ready",
        }
    }
}

/// What the main loop does next.
enum Flow {
    Resume(OplogTimestamp),
    Shutdown,
}

/// Tails one replica set's oplog into every target.
pub struct OplogTailer {
    key: String,
    source: Arc<dyn OplogSource>,
    targets: Vec<Arc<dyn ReplicationTarget>>,
    checkpoints: Arc<CheckpointStore>,
    settings: TailerSettings,
    state_tx: watch::Sender<TailerState>,
    shutdown_rx: watch::Receiver<bool>,
    last_persisted: Option<OplogTimestamp>,
}

impl OplogTailer {
    pub fn new(
        source: Arc<dyn OplogSource>,
        targets: Vec<Arc<dyn ReplicationTarget>>,
        checkpoints: Arc<CheckpointStore>,
        settings: TailerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TailerState::Init);
        Self {
            key: source.name().to_string(),
            source,
            targets,
            checkpoints,
            settings,
            state_tx,
            shutdown_rx,
            last_persisted: None,
        }
    }

    /// Checkpoint key (the replica set name).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> TailerState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<TailerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: TailerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Tailer state change");
            metrics::set_tailer_state(&self.key, state.as_str());
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown_rx) => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Run until cancelled or an unrecoverable error occurs.
    ///
    /// The checkpoint store is persisted on every exit path.
    pub async fn run(mut self) -> Result<()> {
        let span = info_span!("tailer", shard = %self.key);

        async move {
            info!(targets = self.targets.len(), "Starting oplog tailer");
            let result = self.run_loop().await;

            if let Err(e) = self.checkpoints.persist().await {
                warn!(error = %e, "Final checkpoint persist failed");
            }
            match &result {
                Ok(()) => info!("Oplog tailer stopped"),
                Err(e) => error!(error = %e, "Oplog tailer failed"),
            }
            self.set_state(TailerState::Stopped);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.set_state(TailerState::Init);

        let mut position = match self.checkpoints.get(&self.key).await {
            Some(ts) => {
                info!(checkpoint = %ts, "Resuming from checkpoint");
                ts
            }
            None => match self.initialize().await? {
                Some(ts) => ts,
                None => return Ok(()),
            },
        };

        loop {
            if self.is_shutdown() {
                return Ok(());
            }

            match self.step(position).await {
                Ok(Flow::Resume(ts)) => position = ts,
                Ok(Flow::Shutdown) => return Ok(()),
                Err(e) if e.is_retryable() => match self.reconnect(&e).await? {
                    Some(ts) => position = ts,
                    None => return Ok(()),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Position the cursor and act on the result.
    async fn step(&mut self, position: OplogTimestamp) -> Result<Flow> {
        self.set_state(TailerState::Seeking);

        match self.position_cursor(position).await? {
            Position::Ready(stream) => {
                self.set_state(TailerState::Tailing);
                self.consume(stream, position).await
            }
            Position::CaughtUp => {
                if self.pause(self.settings.idle_interval).await {
                    Ok(Flow::Resume(position))
                } else {
                    Ok(Flow::Shutdown)
                }
            }
            Position::AgedOut => {
                self.set_state(TailerState::RollingBack);
                match self.rollback().await? {
                    RollbackOutcome::ResumeFrom(cutoff) => {
                        self.commit_checkpoint(cutoff).await;
                        Ok(Flow::Resume(cutoff))
                    }
                    RollbackOutcome::Reinitialize => match self.initialize().await? {
                        Some(ts) => Ok(Flow::Resume(ts)),
                        None => Ok(Flow::Shutdown),
                    },
                }
            }
        }
    }

    /// No checkpoint: dump (if enabled) and checkpoint the oplog top
    /// captured before the dump. `None` means cancelled.
    async fn initialize(&mut self) -> Result<Option<OplogTimestamp>> {
        let top = loop {
            let source = Arc::clone(&self.source);
            let top = retry_until_ok(&self.settings.retry, "oplog_top", || source.oplog_top()).await?;
            match top {
                Some(ts) => break ts,
                None => {
                    info!("Oplog is empty, waiting for the first entry");
                    if !self.pause(self.settings.idle_interval).await {
                        return Ok(None);
                    }
                }
            }
        };

        if self.settings.collection_dump {
            self.set_state(TailerState::Dumping);
            if !self.dump_collections(top).await? {
                return Ok(None);
            }
        } else {
            info!(top = %top, "Collection dump disabled, starting from oplog top");
        }

        self.commit_checkpoint(top).await;
        Ok(Some(top))
    }

    /// Count entries at or after `ts` and decide how to continue.
    pub async fn position_cursor(&self, ts: OplogTimestamp) -> Result<Position> {
        let filter = &self.settings.namespaces;
        let count = self.source.count_entries(ts, filter).await?;
        let position = if count == 0 {
            Position::AgedOut
        } else {
            let mut stream = self.source.tail(ts, filter).await?;
            let first = match stream.next().await {
                Some(entry) => entry?,
                None => {
                    return Err(ConnectorError::mongo(
                        "position_cursor",
                        "oplog cursor closed before its first entry",
                    ))
                }
            };

            if first.ts > ts {
                return Err(ConnectorError::FellBehind {
                    requested: ts,
                    oldest: first.ts,
                });
            }
            if first.ts != ts {
                return Err(ConnectorError::CheckpointMismatch {
                    checkpoint: ts,
                    found: first.ts,
                });
            }

            if count == 1 {
                Position::CaughtUp
            } else {
                Position::Ready(stream)
            }
        };

        metrics::record_position(&self.key, position.label());
        debug!(checkpoint = %ts, count, outcome = position.label(), "Positioned oplog cursor");
        Ok(position)
    }

    /// Apply entries until the cursor ends, an error occurs or shutdown.
    async fn consume(&mut self, mut stream: OplogStream, mut last: OplogTimestamp) -> Result<Flow> {
        let idle = self.settings.idle_interval;
        let mut since_checkpoint = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown_rx) => {
                    info!("Shutdown signal received while tailing");
                    self.commit_checkpoint(last).await;
                    return Ok(Flow::Shutdown);
                }
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            match next {
                // Quiet cursor: batch boundary.
                Err(_) => {
                    self.commit_checkpoint(last).await;
                    since_checkpoint = 0;
                }
                Ok(None) => {
                    debug!("Oplog cursor closed, repositioning");
                    self.commit_checkpoint(last).await;
                    return Ok(Flow::Resume(last));
                }
                // An entry this connector cannot read is not applied, so the
                // checkpoint stays on the last one it did apply.
                Ok(Some(Err(ConnectorError::MalformedEntry(reason)))) => {
                    warn!(reason = %reason, "Skipping unreadable oplog entry");
                    metrics::record_entry_skipped(&self.key, "malformed");
                }
                Ok(Some(Err(e))) => {
                    self.commit_checkpoint(last).await;
                    return Err(e);
                }
                Ok(Some(Ok(entry))) => {
                    let ts = entry.ts;
                    if self.apply(entry).await {
                        last = ts;
                        since_checkpoint += 1;
                        let every = self.settings.checkpoint_every;
                        if every > 0 && since_checkpoint >= every {
                            self.commit_checkpoint(last).await;
                            since_checkpoint = 0;
                        }
                    }
                }
            }
        }
    }

    /// Filter, remap and dispatch one entry. Returns whether it was applied.
    async fn apply(&self, entry: OplogEntry) -> bool {
        if entry.from_migrate {
            metrics::record_entry_skipped(&self.key, "migrate");
            return false;
        }
        if !entry.op.is_data_op() {
            metrics::record_entry_skipped(&self.key, "command");
            return false;
        }
        if !self.settings.namespaces.is_included(&entry.ns) {
            metrics::record_entry_skipped(&self.key, "filtered");
            return false;
        }

        let entry = match self.settings.fields.filter_entry(entry) {
            Some(entry) => entry,
            None => {
                metrics::record_entry_skipped(&self.key, "filtered");
                return false;
            }
        };
        let id = match entry.document_key() {
            Some(id) => id.clone(),
            None => {
                warn!(ns = %entry.ns, ts = %entry.ts, "Entry has no document key, skipping");
                metrics::record_entry_skipped(&self.key, "no_key");
                return false;
            }
        };
        let namespace = self.settings.namespaces.map(&entry.ns);

        match entry.op {
            OplogOp::Delete => {
                let doc = ReplicatedDocument::key_only(id, namespace, entry.ts);
                for target in &self.targets {
                    match target.remove(doc.clone()).await {
                        Err(TargetError::NotFound(_)) => {
                            debug!(target = target.name(), "Removed document was already absent");
                        }
                        result => self.log_target_result(target.as_ref(), "remove", &entry, result),
                    }
                }
            }
            OplogOp::Insert => {
                let fields = self.rekey(entry.object.clone());
                let doc = ReplicatedDocument::new(id, namespace, entry.ts, fields);
                for target in &self.targets {
                    let result = target.upsert(doc.clone()).await;
                    self.log_target_result(target.as_ref(), "upsert", &entry, result);
                }
            }
            OplogOp::Update => {
                let mut selector = Document::new();
                selector.insert(self.settings.fields.unique_key(), id.clone());
                let doc = ReplicatedDocument::new(id, namespace, entry.ts, selector);
                let is_replacement = !entry.object.keys().any(|k| k.starts_with('$'));
                let spec = if is_replacement {
                    self.rekey(entry.object.clone())
                } else {
                    entry.object.clone()
                };
                for target in &self.targets {
                    let result = target.update(doc.clone(), spec.clone()).await.map(|_| ());
                    self.log_target_result(target.as_ref(), "update", &entry, result);
                }
            }
            OplogOp::Command | OplogOp::Noop => return false,
        }

        metrics::record_entry_applied(&self.key, entry.op.code());
        true
    }

    fn log_target_result(
        &self,
        target: &dyn ReplicationTarget,
        operation: &'static str,
        entry: &OplogEntry,
        result: std::result::Result<(), TargetError>,
    ) {
        if let Err(e) = result {
            warn!(
                target = target.name(),
                operation,
                ns = %entry.ns,
                ts = %entry.ts,
                error = %e,
                "Target failed to apply entry, skipping it for this target"
            );
            metrics::record_target_error(&self.key, target.name(), operation);
        }
    }

    /// Record `ts` as this shard's checkpoint and write the file.
    ///
    /// A failed write is logged; the supervisor retries on its next pass.
    async fn commit_checkpoint(&mut self, ts: OplogTimestamp) {
        if self.last_persisted == Some(ts) {
            return;
        }
        self.checkpoints.set(&self.key, ts).await;
        metrics::record_checkpoint(&self.key, ts.seconds);
        match self.checkpoints.persist().await {
            Ok(()) => self.last_persisted = Some(ts),
            Err(e) => warn!(checkpoint = %ts, error = %e, "Failed to persist checkpoint"),
        }
    }

    /// Persist, reconnect and return the checkpoint to resume from.
    /// `None` means cancelled while waiting.
    async fn reconnect(&mut self, cause: &ConnectorError) -> Result<Option<OplogTimestamp>> {
        self.set_state(TailerState::Reconnecting);
        warn!(error = %cause, "Lost source connection, reconnecting");
        metrics::record_reconnect(&self.key);

        if let Err(e) = self.checkpoints.persist().await {
            warn!(error = %e, "Failed to persist checkpoint before reconnect");
        }

        loop {
            if !self.pause(self.settings.reconnect_delay).await {
                return Ok(None);
            }
            match self.source.reconnect().await {
                Ok(()) => break,
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Reconnect failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        match self.checkpoints.get(&self.key).await {
            Some(ts) => {
                info!(checkpoint = %ts, "Reconnected, resuming from checkpoint");
                Ok(Some(ts))
            }
            None => self.initialize().await,
        }
    }

    /// Build the document shipped to targets for a dumped or re-read source document.
    fn to_replicated(&self, source_ns: &str, doc: Document, ts: OplogTimestamp) -> Option<ReplicatedDocument> {
        let fields = self.settings.fields.filter_document(doc);
        let id: Bson = fields.get(SOURCE_KEY)?.clone();
        Some(ReplicatedDocument::new(
            id,
            self.settings.namespaces.map(source_ns),
            ts,
            self.rekey(fields),
        ))
    }

    /// Move the source `_id` under the configured unique-key field.
    fn rekey(&self, mut fields: Document) -> Document {
        let unique_key = self.settings.fields.unique_key();
        if unique_key != SOURCE_KEY {
            if let Some(id) = fields.remove(SOURCE_KEY) {
                fields.insert(unique_key, id);
            }
        }
        fields
    }
}

/// Resolve once shutdown is requested or the sender is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
