//! Prometheus metric families recorded by the pipeline.
//!
//! The families are owned here and registered into the admin surface's
//! registry at startup; the loop and the background probes update them
//! through shared handles.

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Label set for source API requests.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: &'static str,
}

/// Label set for sink operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StorageOpLabels {
    pub operation: &'static str,
    pub status: &'static str,
}

/// All metric families emitted by the service.
pub struct SyncMetrics {
    /// Events successfully handed to the sink.
    pub changes_processed: Counter,
    /// Tick failures.
    pub changes_errors: Counter,
    /// Seconds between the newest event in the last page and now.
    pub changes_lag_seconds: Gauge<f64, AtomicU64>,
    /// Whole-tick duration.
    pub sync_duration_seconds: Histogram,
    /// Source API requests by outcome.
    pub source_requests: Family<StatusLabels, Counter>,
    /// Source fetch latency.
    pub source_request_duration_seconds: Histogram,
    /// Unix timestamp of the last successful fetch.
    pub last_successful_fetch: Gauge<f64, AtomicU64>,
    /// Sink operations by kind and outcome.
    pub storage_operations: Family<StorageOpLabels, Counter>,
    /// 1 when the sink connection is healthy, 0 otherwise.
    pub storage_connection_status: Gauge,
    /// Seconds the service has been up, incremented once per second.
    pub uptime_seconds: Counter,
    /// Unix timestamp of service start.
    pub service_start_timestamp: Gauge<f64, AtomicU64>,
}

impl SyncMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            changes_processed: Counter::default(),
            changes_errors: Counter::default(),
            changes_lag_seconds: Gauge::default(),
            sync_duration_seconds: Histogram::new(exponential_buckets(0.005, 2.0, 12)),
            source_requests: Family::default(),
            source_request_duration_seconds: Histogram::new(exponential_buckets(0.005, 2.0, 12)),
            last_successful_fetch: Gauge::default(),
            storage_operations: Family::default(),
            storage_connection_status: Gauge::default(),
            uptime_seconds: Counter::default(),
            service_start_timestamp: Gauge::default(),
        }
    }

    /// Register every family under the `tuplesync` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("tuplesync");
        registry.register(
            "changes_processed",
            "Total number of changes processed successfully",
            self.changes_processed.clone(),
        );
        registry.register(
            "changes_errors",
            "Total number of change processing errors",
            self.changes_errors.clone(),
        );
        registry.register(
            "changes_lag_seconds",
            "Lag between the newest change timestamp and now",
            self.changes_lag_seconds.clone(),
        );
        registry.register(
            "sync_duration_seconds",
            "Duration of sync ticks",
            self.sync_duration_seconds.clone(),
        );
        registry.register(
            "source_requests",
            "Source API requests by status",
            self.source_requests.clone(),
        );
        registry.register(
            "source_request_duration_seconds",
            "Duration of source API fetches",
            self.source_request_duration_seconds.clone(),
        );
        registry.register(
            "source_last_successful_fetch",
            "Unix timestamp of the last successful fetch",
            self.last_successful_fetch.clone(),
        );
        registry.register(
            "storage_operations",
            "Sink operations by kind and status",
            self.storage_operations.clone(),
        );
        registry.register(
            "storage_connection_status",
            "Sink connection health (1 = connected)",
            self.storage_connection_status.clone(),
        );
        registry.register(
            "service_uptime_seconds",
            "Total service uptime in seconds",
            self.uptime_seconds.clone(),
        );
        registry.register(
            "service_start_timestamp",
            "Unix timestamp of service start",
            self.service_start_timestamp.clone(),
        );
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_register_and_encode() {
        let metrics = SyncMetrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        metrics.changes_processed.inc_by(3);
        metrics
            .source_requests
            .get_or_create(&StatusLabels { status: "success" })
            .inc();
        metrics
            .storage_operations
            .get_or_create(&StorageOpLabels {
                operation: "apply",
                status: "success",
            })
            .inc();
        metrics.changes_lag_seconds.set(1.5);
        metrics.storage_connection_status.set(1);

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(out.contains("tuplesync_changes_processed_total 3"));
        assert!(out.contains(r#"status="success""#));
        assert!(out.contains("tuplesync_storage_connection_status 1"));
    }
}
