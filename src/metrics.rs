//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - NRTM3 queries, protocol errors and session counts
//! - Entries streamed to mirrors
//! - NRTM4 generation outcomes and lock waits
//! - Store retries
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `nrtm_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use nrtm_engine::metrics;
//! use std::time::Duration;
//!
//! // In a session after a mirror response
//! metrics::record_entries_streamed("RIPE", 42);
//!
//! // In the publisher after a delta commit
//! metrics::record_delta_generated("RIPE", 7, 12, Duration::from_millis(50));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// NRTM3 Metrics
// =============================================================================

/// Record a parsed NRTM3 query by kind (`sources`, `version`, `mirror`) and outcome.
pub fn record_query(kind: &str, outcome: &str) {
    counter!("nrtm_queries_total", "kind" => kind.to_string(), "outcome" => outcome.to_string()).increment(1);
}

/// Record a protocol error written to a client, by legacy code.
pub fn record_protocol_error(code: u16) {
    counter!("nrtm_protocol_errors_total", "code" => code.to_string()).increment(1);
}

/// Gauge for number of open NRTM3 sessions.
pub fn set_active_sessions(count: usize) {
    gauge!("nrtm_active_sessions").set(count as f64);
}

/// Record a connection refused because the session bulkhead was full.
pub fn record_session_rejected() {
    counter!("nrtm_sessions_rejected_total").increment(1);
}

/// Record a finished session and how it ended.
pub fn record_session_closed(reason: &str, duration: Duration) {
    counter!("nrtm_sessions_closed_total", "reason" => reason.to_string()).increment(1);
    histogram!("nrtm_session_duration_seconds").record(duration.as_secs_f64());
}

/// Record entries written to mirror clients.
pub fn record_entries_streamed(source: &str, count: usize) {
    counter!("nrtm_entries_streamed_total", "source" => source.to_string()).increment(count as u64);
}

// =============================================================================
// NRTM4 Metrics
// =============================================================================

/// Record a committed delta file.
pub fn record_delta_generated(source: &str, version: i64, changes: usize, duration: Duration) {
    counter!("nrtm_deltas_generated_total", "source" => source.to_string()).increment(1);
    counter!("nrtm_delta_changes_total", "source" => source.to_string()).increment(changes as u64);
    gauge!("nrtm_current_version", "source" => source.to_string()).set(version as f64);
    histogram!("nrtm_generation_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
}

/// Record a committed snapshot file.
pub fn record_snapshot_generated(source: &str, objects: usize, duration: Duration) {
    counter!("nrtm_snapshots_generated_total", "source" => source.to_string()).increment(1);
    gauge!("nrtm_snapshot_objects", "source" => source.to_string()).set(objects as f64);
    gauge!("nrtm_current_version", "source" => source.to_string()).set(1.0);
    histogram!("nrtm_generation_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
}

/// Record a generation run that produced nothing (`no_changes`, `all_filtered`).
pub fn record_delta_skipped(source: &str, reason: &str) {
    counter!("nrtm_deltas_skipped_total", "source" => source.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Record a failed generation run by error kind.
pub fn record_generation_failure(source: &str, kind: &str) {
    counter!("nrtm_generation_failures_total", "source" => source.to_string(), "kind" => kind.to_string()).increment(1);
}

/// Record the time spent waiting for a generation lock.
pub fn record_lock_wait(lock_name: &str, acquired: bool, waited: Duration) {
    let outcome = if acquired { "acquired" } else { "contended" };
    counter!("nrtm_lock_acquisitions_total", "lock" => lock_name.to_string(), "outcome" => outcome).increment(1);
    histogram!("nrtm_lock_wait_seconds", "lock" => lock_name.to_string()).record(waited.as_secs_f64());
}

// =============================================================================
// Store / Engine Metrics
// =============================================================================

/// Record store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("nrtm_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encoded as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("nrtm_engine_state").set(value);
}
