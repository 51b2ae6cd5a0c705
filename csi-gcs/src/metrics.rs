//! Prometheus metrics for the CSI driver
//!
//! Covers RPC outcomes and latency, the number of live mounts, mount
//! failures and orphan cleanup.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Gauge: Mount table entries on this node
    pub const CSI_ACTIVE_MOUNTS: &str = "csi_active_mounts";
    /// Counter: Failed mounts and unmounts by reason
    pub const CSI_MOUNT_FAILURES_TOTAL: &str = "csi_mount_failures_total";
    /// Counter: Pods deleted because their mount did not survive a restart
    pub const CSI_ORPHANED_PODS_DELETED_TOTAL: &str = "csi_orphaned_pods_deleted_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn set_active_mounts(count: usize) {
    gauge!(names::CSI_ACTIVE_MOUNTS).set(count as f64);
}

pub fn record_mount_failure(reason: &'static str) {
    counter!(names::CSI_MOUNT_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_orphaned_pod_deleted() {
    counter!(names::CSI_ORPHANED_PODS_DELETED_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}
