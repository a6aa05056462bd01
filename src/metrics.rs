//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Oplog entries applied and skipped per shard
//! - Per-target write failures
//! - Checkpoint position and persistence
//! - Collection dump progress
//! - Rollback reconciliation
//! - Tailer and connector lifecycle state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `oplog_connector_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only records through the `metrics` facade; the embedding binary
//! installs an exporter.
//!
//! # Usage
//!
//! ```rust,no_run
//! use oplog_connector::metrics;
//! use std::time::Duration;
//!
//! metrics::record_entry_applied("rs0", "i");
//! metrics::record_rollback("rs0", 3, 1, Duration::from_millis(120));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one applied oplog entry by op code.
pub fn record_entry_applied(shard: &str, op: &str) {
    counter!(
        "oplog_connector_entries_applied_total",
        "shard" => shard.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}

/// Record an entry that was read but not forwarded.
///
/// Reasons: `migrate`, `command`, `filtered`, `no_key`.
pub fn record_entry_skipped(shard: &str, reason: &'static str) {
    counter!(
        "oplog_connector_entries_skipped_total",
        "shard" => shard.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a target operation that failed (the entry is dropped for that target).
pub fn record_target_error(shard: &str, target: &str, operation: &'static str) {
    counter!(
        "oplog_connector_target_errors_total",
        "shard" => shard.to_string(),
        "target" => target.to_string(),
        "operation" => operation
    )
    .increment(1);
}

/// Record the checkpointed position of a shard.
pub fn record_checkpoint(shard: &str, seconds: u32) {
    gauge!("oplog_connector_checkpoint_seconds", "shard" => shard.to_string()).set(seconds as f64);
}

/// Record a checkpoint file write.
pub fn record_checkpoint_persist(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("oplog_connector_checkpoint_persists_total", "status" => status).increment(1);
}

/// Record a retried metadata call.
pub fn record_retry(operation: &str) {
    counter!("oplog_connector_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record the outcome of positioning the oplog cursor.
pub fn record_position(shard: &str, outcome: &'static str) {
    counter!(
        "oplog_connector_positions_total",
        "shard" => shard.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a reconnect cycle.
pub fn record_reconnect(shard: &str) {
    counter!("oplog_connector_reconnects_total", "shard" => shard.to_string()).increment(1);
}

/// Record documents copied by the collection dump.
pub fn record_dump_documents(shard: &str, count: usize) {
    counter!("oplog_connector_dump_documents_total", "shard" => shard.to_string())
        .increment(count as u64);
}

/// Record a completed collection dump.
pub fn record_dump_complete(shard: &str, namespaces: usize, duration: Duration) {
    counter!("oplog_connector_dumps_total", "shard" => shard.to_string()).increment(1);
    gauge!("oplog_connector_dump_namespaces", "shard" => shard.to_string()).set(namespaces as f64);
    histogram!("oplog_connector_dump_duration_seconds", "shard" => shard.to_string())
        .record(duration.as_secs_f64());
}

/// Record a rollback reconciliation.
pub fn record_rollback(shard: &str, confirmed: usize, removed: usize, duration: Duration) {
    let shard = shard.to_string();
    counter!("oplog_connector_rollbacks_total", "shard" => shard.clone()).increment(1);
    counter!("oplog_connector_rollback_confirmed_total", "shard" => shard.clone())
        .increment(confirmed as u64);
    counter!("oplog_connector_rollback_removed_total", "shard" => shard.clone())
        .increment(removed as u64);
    histogram!("oplog_connector_rollback_duration_seconds", "shard" => shard)
        .record(duration.as_secs_f64());
}

/// Record tailer state (one-hot gauge per state label).
pub fn set_tailer_state(shard: &str, state: &str) {
    gauge!(
        "oplog_connector_tailer_state",
        "shard" => shard.to_string(),
        "state" => state.to_string()
    )
    .set(1.0);
}

/// Gauge for number of running tailers.
pub fn set_active_tailers(count: usize) {
    gauge!("oplog_connector_active_tailers").set(count as f64);
}

/// Gauge for connector state.
pub fn set_connector_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("oplog_connector_state").set(value);
}
