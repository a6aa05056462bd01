//! Rollback reconciliation.
//!
//! Runs when the checkpoint is past the end of the oplog: the primary we
//! were reading from lost writes in an election, and the targets may hold
//! documents that no longer exist anywhere in the replica set.
//!
//! 1. Commit every target and take the newest document across all of them.
//! 2. Find the newest oplog entry at or before that document: the cutoff.
//! 3. Ask every target for the documents it holds in `[cutoff, newest]`.
//! 4. Re-read each from the source by its original namespace and `_id`:
//!    documents that still exist are re-upserted stamped with the cutoff,
//!    documents that are gone are removed.
//! 5. Resume tailing from the cutoff.
//!
//! Best effort: per-document target failures are logged, and removing a
//! document that is already absent is not an error.

use super::OplogTailer;
use crate::error::{ConnectorError, Result};
use crate::metrics;
use crate::oplog::SOURCE_KEY;
use crate::target::{ReplicatedDocument, TargetError};
use crate::timestamp::OplogTimestamp;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where to go after a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Tail from this position.
    ResumeFrom(OplogTimestamp),
    /// Targets hold nothing; start over as if there were no checkpoint.
    Reinitialize,
}

impl OplogTailer {
    /// Reconcile every target with the current oplog.
    pub async fn rollback(&self) -> Result<RollbackOutcome> {
        let start = Instant::now();

        // 1. Newest applied document across targets.
        let mut newest: Option<ReplicatedDocument> = None;
        for target in &self.targets {
            target
                .commit()
                .await
                .map_err(|e| ConnectorError::target(target.name(), e))?;
            let last = target
                .get_last_doc()
                .await
                .map_err(|e| ConnectorError::target(target.name(), e))?;
            if let Some(doc) = last {
                if newest.as_ref().map_or(true, |n| doc.ts > n.ts) {
                    newest = Some(doc);
                }
            }
        }
        let Some(newest) = newest else {
            info!("No target holds any document, nothing to roll back");
            return Ok(RollbackOutcome::Reinitialize);
        };
        let newest_ts = newest.timestamp();

        // 2. Cutoff.
        let cutoff = match self.source.entry_at_or_before(newest_ts).await? {
            Some(cutoff) => cutoff,
            None => {
                warn!(
                    newest = %newest_ts,
                    "No oplog entry at or before the newest applied document, resuming from oplog top"
                );
                return Ok(match self.source.oplog_top().await? {
                    Some(top) => RollbackOutcome::ResumeFrom(top),
                    None => RollbackOutcome::Reinitialize,
                });
            }
        };
        info!(newest = %newest_ts, cutoff = %cutoff, "Rolling back");

        let mut confirmed = 0usize;
        let mut removed = 0usize;

        for target in &self.targets {
            // 3. Documents this target holds inside the window.
            let docs = target
                .search(cutoff.as_u64(), newest_ts.as_u64())
                .await
                .map_err(|e| ConnectorError::target(target.name(), e))?;
            if docs.is_empty() {
                continue;
            }

            let mut by_namespace: HashMap<String, Vec<ReplicatedDocument>> = HashMap::new();
            for doc in docs {
                by_namespace
                    .entry(self.settings.namespaces.unmap(&doc.namespace))
                    .or_default()
                    .push(doc);
            }

            // 4. Confirm against the source.
            for (source_ns, docs) in by_namespace {
                let ids = docs.iter().map(|d| d.id.clone()).collect();
                let current = self.source.find_documents(&source_ns, SOURCE_KEY, ids).await?;
                let mut current: HashMap<String, bson::Document> = current
                    .into_iter()
                    .filter_map(|d| {
                        let key = d.get(SOURCE_KEY)?.to_string();
                        Some((key, d))
                    })
                    .collect();

                for doc in docs {
                    match current.remove(&doc.id.to_string()) {
                        Some(source_doc) => {
                            let Some(restored) = self.to_replicated(&source_ns, source_doc, cutoff) else {
                                continue;
                            };
                            match target.upsert(restored).await {
                                Ok(()) => confirmed += 1,
                                Err(e) => {
                                    warn!(target = target.name(), ns = %source_ns, id = %doc.id, error = %e, "Rollback re-upsert failed");
                                    metrics::record_target_error(&self.key, target.name(), "upsert");
                                }
                            }
                        }
                        None => {
                            let id = doc.id.clone();
                            match target.remove(doc).await {
                                Ok(()) => removed += 1,
                                Err(TargetError::NotFound(_)) => {
                                    debug!(target = target.name(), id = %id, "Rolled-back document already absent");
                                }
                                Err(e) => {
                                    warn!(target = target.name(), ns = %source_ns, id = %id, error = %e, "Rollback remove failed");
                                    metrics::record_target_error(&self.key, target.name(), "remove");
                                }
                            }
                        }
                    }
                }
            }

            if let Err(e) = target.commit().await {
                warn!(target = target.name(), error = %e, "Commit after rollback failed");
            }
        }

        metrics::record_rollback(&self.key, confirmed, removed, start.elapsed());
        info!(cutoff = %cutoff, confirmed, removed, "Rollback complete");

        // 5.
        Ok(RollbackOutcome::ResumeFrom(cutoff))
    }
}
