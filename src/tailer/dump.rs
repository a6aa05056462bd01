//! Initial collection dump.
//!
//! Copies every in-scope collection into the targets before tailing starts.
//! Targets with the [`BulkUpsert`](crate::target::BulkUpsert) capability get
//! chunks of `dump_chunk_size` documents; every other target gets its own
//! helper task fed through a bounded channel, so a slow target does not hold
//! back the rest. Any helper failure fails the dump.
//!
//! Every dumped document carries the oplog top captured before the dump
//! started. Dump progress is not resumable: a failed or cancelled dump
//! leaves no checkpoint behind.

use super::OplogTailer;
use crate::error::{ConnectorError, Result};
use crate::metrics;
use crate::resilience::{retry_if, retry_until_ok, RateLimiter, RetryConfig};
use crate::target::{ReplicatedDocument, ReplicationTarget, TargetError};
use crate::timestamp::OplogTimestamp;
use futures::future::join_all;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

impl OplogTailer {
    /// Dump every in-scope collection. Returns `false` if cancelled.
    pub(super) async fn dump_collections(&self, t0: OplogTimestamp) -> Result<bool> {
        let start = Instant::now();
        let settings = &self.settings;
        let source = Arc::clone(&self.source);

        let namespaces: Vec<String> =
            retry_until_ok(&settings.retry, "list_namespaces", || source.list_namespaces())
                .await?
                .into_iter()
                .filter(|ns| settings.namespaces.is_included(ns))
                .collect();
        info!(namespaces = namespaces.len(), top = %t0, "Starting collection dump");

        let bulk_targets: Vec<&Arc<dyn ReplicationTarget>> =
            self.targets.iter().filter(|t| t.bulk().is_some()).collect();

        let mut senders = Vec::new();
        let mut helpers: Vec<(String, JoinHandle<Result<usize>>)> = Vec::new();
        for target in self.targets.iter().filter(|t| t.bulk().is_none()) {
            let (tx, rx) = mpsc::channel(settings.dump_chunk_size.max(1));
            let handle = tokio::spawn(upsert_one_by_one(
                Arc::clone(target),
                rx,
                settings.retry.clone(),
                settings.continue_on_error,
            ));
            helpers.push((target.name().to_string(), handle));
            senders.push(tx);
        }

        let limiter = settings.dump_rate_limit.clone().map(RateLimiter::new);
        let mut chunk: Vec<ReplicatedDocument> = Vec::with_capacity(settings.dump_chunk_size);
        let mut copied = 0usize;
        let mut outcome: Result<bool> = Ok(true);

        'namespaces: for ns in &namespaces {
            let mut docs = match source.dump_collection(ns).await {
                Ok(docs) => docs,
                Err(e) => {
                    outcome = Err(ConnectorError::DumpFailed(format!("{}: {}", ns, e)));
                    break;
                }
            };
            debug!(ns = %ns, "Dumping collection");

            while let Some(next) = docs.next().await {
                if self.is_shutdown() {
                    info!("Shutdown signal received during dump");
                    outcome = Ok(false);
                    break 'namespaces;
                }

                let doc = match next {
                    Ok(doc) => doc,
                    Err(e) => {
                        outcome = Err(ConnectorError::DumpFailed(format!("{}: {}", ns, e)));
                        break 'namespaces;
                    }
                };
                let replicated = match self.to_replicated(ns, doc, t0) {
                    Some(doc) => doc,
                    None => {
                        warn!(ns = %ns, "Document without unique key, not dumped");
                        continue;
                    }
                };

                if let Some(limiter) = &limiter {
                    limiter.acquire().await;
                }

                for tx in &senders {
                    if tx.send(replicated.clone()).await.is_err() {
                        // Helper exited early; its error is collected below.
                        break 'namespaces;
                    }
                }

                if !bulk_targets.is_empty() {
                    chunk.push(replicated);
                    if chunk.len() >= settings.dump_chunk_size {
                        if let Err(e) = self.flush_bulk(&bulk_targets, std::mem::take(&mut chunk)).await {
                            outcome = Err(e);
                            break 'namespaces;
                        }
                    }
                }
                copied += 1;
            }
        }

        if matches!(outcome, Ok(true)) && !chunk.is_empty() {
            if let Err(e) = self.flush_bulk(&bulk_targets, chunk).await {
                outcome = Err(e);
            }
        }

        drop(senders);
        let (names, handles): (Vec<String>, Vec<_>) = helpers.into_iter().unzip();
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            let failure = match joined {
                Ok(Ok(count)) => {
                    debug!(target = %name, documents = count, "Dump helper finished");
                    None
                }
                Ok(Err(e)) => Some(e),
                Err(join_error) => Some(ConnectorError::DumpFailed(format!(
                    "helper for {} panicked: {}",
                    name, join_error
                ))),
            };
            if let Some(e) = failure {
                warn!(target = %name, error = %e, "Dump helper failed");
                if !matches!(outcome, Err(_)) {
                    outcome = Err(e);
                }
            }
        }

        metrics::record_dump_documents(&self.key, copied);
        if !matches!(outcome, Ok(true)) {
            return outcome;
        }

        for target in &self.targets {
            if let Err(e) = target.commit().await {
                if !settings.continue_on_error {
                    return Err(ConnectorError::DumpFailed(format!("commit on {}: {}", target.name(), e)));
                }
                warn!(target = target.name(), error = %e, "Commit after dump failed");
            }
        }

        metrics::record_dump_complete(&self.key, namespaces.len(), start.elapsed());
        info!(
            documents = copied,
            namespaces = namespaces.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Collection dump complete"
        );
        Ok(true)
    }

    async fn flush_bulk(
        &self,
        targets: &[&Arc<dyn ReplicationTarget>],
        docs: Vec<ReplicatedDocument>,
    ) -> Result<()> {
        for target in targets {
            let Some(bulk) = target.bulk() else { continue };
            let result = retry_if(
                &self.settings.retry,
                "bulk_upsert",
                TargetError::is_retryable,
                || bulk.bulk_upsert(docs.clone()),
            )
            .await;

            if let Err(e) = result {
                if !self.settings.continue_on_error {
                    return Err(ConnectorError::DumpFailed(format!(
                        "bulk upsert on {}: {}",
                        target.name(),
                        e
                    )));
                }
                warn!(target = target.name(), documents = docs.len(), error = %e, "Bulk upsert failed, chunk skipped");
                metrics::record_target_error(&self.key, target.name(), "bulk_upsert");
            }
        }
        Ok(())
    }
}

/// Feed one target from the dump channel until it closes.
async fn upsert_one_by_one(
    target: Arc<dyn ReplicationTarget>,
    mut rx: mpsc::Receiver<ReplicatedDocument>,
    retry: RetryConfig,
    continue_on_error: bool,
) -> Result<usize> {
    let mut written = 0usize;
    while let Some(doc) = rx.recv().await {
        let result = retry_if(&retry, "upsert", TargetError::is_retryable, || {
            target.upsert(doc.clone())
        })
        .await;

        match result {
            Ok(()) => written += 1,
            Err(e) if continue_on_error => {
                warn!(target = target.name(), id = %doc.id, error = %e, "Upsert failed during dump, document skipped");
            }
            Err(e) => {
                return Err(ConnectorError::DumpFailed(format!(
                    "upsert on {}: {}",
                    target.name(),
                    e
                )))
            }
        }
    }
    Ok(written)
}
