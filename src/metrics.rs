// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for pinsync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `pinsync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: configured backend name
//! - `op`: push, pull, delete, list, health
//! - `status`: success, error, retried

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a transfer operation outcome.
pub fn record_transfer(backend: &str, op: &str, status: &str) {
    counter!(
        "pinsync_transfers_total",
        "backend" => backend.to_string(),
        "op" => op.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record transfer latency.
pub fn record_transfer_latency(backend: &str, op: &str, duration: Duration) {
    histogram!(
        "pinsync_transfer_seconds",
        "backend" => backend.to_string(),
        "op" => op.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a completed sync pass.
pub fn record_sync_pass(backend: &str, outcome: &str, duration: Duration) {
    counter!(
        "pinsync_sync_passes_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "pinsync_sync_pass_seconds",
        "backend" => backend.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the number of currently dirty backends.
pub fn set_dirty_backends(count: usize) {
    gauge!("pinsync_dirty_backends").set(count as f64);
}

/// Set the number of pins currently below their replica floor.
pub fn set_replica_deficit(count: usize) {
    gauge!("pinsync_replica_deficit_pins").set(count as f64);
}

/// Record a digest mismatch on a backend replica.
pub fn record_corruption(backend: &str) {
    counter!(
        "pinsync_corruptions_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record evictions executed against a backend under quota pressure.
pub fn record_eviction(backend: &str, count: usize, bytes: u64) {
    counter!(
        "pinsync_evictions_total",
        "backend" => backend.to_string()
    )
    .increment(count as u64);
    counter!(
        "pinsync_evicted_bytes_total",
        "backend" => backend.to_string()
    )
    .increment(bytes);
}

/// Record tier moves (promotions/demotions) planned for a backend.
pub fn record_tier_moves(backend: &str, direction: &str, count: usize) {
    counter!(
        "pinsync_tier_moves_total",
        "backend" => backend.to_string(),
        "direction" => direction.to_string()
    )
    .increment(count as u64);
}

/// Set quota utilization for a backend (0.0 - 1.0+).
pub fn set_quota_utilization(backend: &str, utilization: f64) {
    gauge!(
        "pinsync_quota_utilization",
        "backend" => backend.to_string()
    )
    .set(utilization);
}

/// Record a quota warning surfaced in a sync result.
pub fn record_quota_warning(backend: &str) {
    counter!(
        "pinsync_quota_warnings_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}
