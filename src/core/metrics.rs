// src/core/metrics.rs

//! Defines and registers Prometheus metrics for engine monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Update pipeline counters ---
    /// The total number of entry updates applied on this node, labeled by operation.
    pub static ref UPDATES_APPLIED_TOTAL: CounterVec =
        register_counter_vec!("opaldb_updates_applied_total", "Total number of entry updates applied, labeled by operation.", &["op"]).unwrap();
    /// The total number of near requests that came back with a remap set.
    pub static ref REMAPS_TOTAL: Counter =
        register_counter!("opaldb_remaps_total", "Total number of near requests remapped to a new topology.").unwrap();
    /// The total number of stale writes silently subsumed under CLOCK ordering.
    pub static ref STALE_WRITES_SUBSUMED_TOTAL: Counter =
        register_counter!("opaldb_stale_writes_subsumed_total", "Total number of stale writes subsumed by a newer version under CLOCK ordering.").unwrap();
    /// The total number of backup update requests sent by this node as a primary.
    pub static ref BACKUP_REQUESTS_TOTAL: Counter =
        register_counter!("opaldb_backup_requests_total", "Total number of backup update requests dispatched.").unwrap();

    // --- Deferred-ack counters ---
    /// The total number of deferred-ack datagrams flushed to primaries.
    pub static ref DEFERRED_ACK_FLUSHES_TOTAL: Counter =
        register_counter!("opaldb_deferred_ack_flushes_total", "Total number of deferred-ack datagrams flushed.").unwrap();
    /// The total number of future versions shipped inside deferred-ack datagrams.
    pub static ref DEFERRED_ACK_VERSIONS_TOTAL: Counter =
        register_counter!("opaldb_deferred_ack_versions_total", "Total number of future versions acknowledged via deferred acks.").unwrap();

    // --- Housekeeping counters ---
    /// The total number of tombstones disposed of by the garbage collector.
    pub static ref TOMBSTONES_COLLECTED_TOTAL: Counter =
        register_counter!("opaldb_tombstones_collected_total", "Total number of tombstones garbage collected.").unwrap();
    /// The total number of entries purged by the active TTL sweeper.
    pub static ref EXPIRED_ENTRIES_TOTAL: Counter =
        register_counter!("opaldb_expired_entries_total", "Total number of entries expired proactively by the TTL sweeper.").unwrap();

    // --- Gauges ---
    /// The number of update futures currently pending in the registry.
    pub static ref PENDING_FUTURES: Gauge =
        register_gauge!("opaldb_pending_futures", "Number of update futures currently registered.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
