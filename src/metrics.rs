// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Routing pass throughput and latency
//! - Gap tracker state (open gaps, expiries, rereads)
//! - Reader queue behavior
//! - Batch creation and data-event inserts
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cdc_router_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed channel pass.
pub fn record_pass(channel_id: &str, rows: u64, duration: Duration) {
    counter!("cdc_router_passes_total", "channel_id" => channel_id.to_string()).increment(1);
    counter!("cdc_router_rows_routed_total", "channel_id" => channel_id.to_string())
        .increment(rows);
    histogram!("cdc_router_pass_duration_seconds", "channel_id" => channel_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed channel pass.
pub fn record_pass_error(channel_id: &str) {
    counter!("cdc_router_pass_errors_total", "channel_id" => channel_id.to_string()).increment(1);
}

/// Record data events inserted for a channel.
pub fn record_data_events(channel_id: &str, count: usize) {
    counter!("cdc_router_data_events_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record outgoing batches created for a channel.
pub fn record_batches_created(channel_id: &str, count: usize) {
    counter!("cdc_router_batches_created_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record rows that fell through to the unrouted pseudo-node.
pub fn record_unrouted_rows(channel_id: &str, count: usize) {
    counter!("cdc_router_unrouted_rows_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Set the count of change rows captured but not yet routed on a channel.
pub fn set_unrouted_depth(channel_id: &str, depth: i64) {
    gauge!("cdc_router_unrouted_depth", "channel_id" => channel_id.to_string())
        .set(depth as f64);
}

/// Set the current number of open gaps.
pub fn set_open_gaps(count: usize) {
    gauge!("cdc_router_open_gaps").set(count as f64);
}

/// Record gap reconciliation churn.
pub fn record_gap_changes(inserted: usize, deleted: usize) {
    counter!("cdc_router_gaps_inserted_total").increment(inserted as u64);
    counter!("cdc_router_gaps_deleted_total").increment(deleted as u64);
}

/// Record gaps abandoned by the expiry policies.
pub fn record_gaps_expired(count: usize) {
    counter!("cdc_router_gaps_expired_total").increment(count as u64);
}

/// Record rows re-read by the open-ended cursor and dropped.
pub fn record_reader_rereads(channel_id: &str, count: u64) {
    counter!("cdc_router_reader_rereads_total", "channel_id" => channel_id.to_string())
        .increment(count);
}

/// Record how long the orchestrator waited on the reader queue.
pub fn record_queue_wait(channel_id: &str, duration: Duration) {
    histogram!("cdc_router_queue_wait_seconds", "channel_id" => channel_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retry of a SQLite statement that hit SQLITE_BUSY/SQLITE_LOCKED.
pub fn store_retries_total(operation: &str) {
    counter!("cdc_router_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record an attempt to take the routing cluster lock.
pub fn record_lock_attempt(acquired: bool) {
    let status = if acquired { "acquired" } else { "skipped" };
    counter!("cdc_router_lock_attempts_total", "status" => status).increment(1);
}

/// Record a channel pass retried under the full projection after a
/// row-too-large failure.
pub fn record_full_projection_retry(channel_id: &str) {
    counter!("cdc_router_full_projection_retries_total", "channel_id" => channel_id.to_string())
        .increment(1);
}
