//! Prometheus metrics for the Lightnovel server.
//!
//! Scheduler and hub counters are emitted from `lightnovel-core` under the
//! names listed in [`names`]; this module owns the recorder and the cache
//! series.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_REMOTE_ERRORS_TOTAL: &str = "cache_remote_errors_total";
    pub const CACHE_LOCAL_ENTRIES: &str = "cache_local_entries";

    // Emitted by lightnovel-core
    pub const SCHEDULER_TASKS_TOTAL: &str = "scheduler_tasks_total";
    pub const HUB_CONNECTIONS: &str = "hub_connections";
    pub const HUB_MESSAGES_SENT_TOTAL: &str = "hub_messages_sent_total";
    pub const HUB_EVICTIONS_TOTAL: &str = "hub_evictions_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a cache hit on the given tier (`local` or `remote`).
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_remote_error(op: &'static str) {
    counter!(names::CACHE_REMOTE_ERRORS_TOTAL, "op" => op).increment(1);
}

pub fn set_local_entries(count: usize) {
    gauge!(names::CACHE_LOCAL_ENTRIES).set(count as f64);
}
