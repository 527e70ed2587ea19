//! Metrics instrumentation for the sync core.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `recordsync_` prefix for all metrics
//! - `_total` suffix for counters
//!
//! # Labels
//! - `source`: cache, network
//! - `operation`: get, list, create, update, delete
//! - `status`: success, error

use metrics::{counter, gauge};

/// Record a completed read or write, tagged by where it was served from.
pub fn record_operation(source: &str, operation: &str, status: &str) {
    counter!(
        "recordsync_operations_total",
        "source" => source.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record rows replayed by a sync drain.
pub fn record_drained(succeeded: usize, failed: usize) {
    counter!("recordsync_drained_rows_total", "status" => "success").increment(succeeded as u64);
    counter!("recordsync_drained_rows_total", "status" => "error").increment(failed as u64);
}

/// Record rows removed by the stale reconciler.
pub fn record_reconciled(count: usize) {
    counter!("recordsync_stale_reconciled_total").increment(count as u64);
}

/// Record rows/blobs/responses removed by a maintenance pass.
pub fn record_maintenance(records: u64, responses: u64, files: u64) {
    counter!("recordsync_maintenance_deleted_total", "kind" => "record").increment(records);
    counter!("recordsync_maintenance_deleted_total", "kind" => "response").increment(responses);
    counter!("recordsync_maintenance_deleted_total", "kind" => "file").increment(files);
}

/// Set the current number of pending (unsynced) rows.
pub fn set_pending_rows(count: usize) {
    gauge!("recordsync_pending_rows").set(count as f64);
}

/// Record a response-cache lookup.
pub fn record_response_cache(hit: bool) {
    let status = if hit { "hit" } else { "miss" };
    counter!("recordsync_response_cache_total", "status" => status.to_string()).increment(1);
}
