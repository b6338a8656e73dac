//! Metrics for volume lifecycle operations
//!
//! Recorded through the `metrics` facade. The embedding node agent installs
//! whatever exporter it uses; without one these calls are no-ops.

use std::time::Instant;

use metrics::{counter, gauge, histogram};

/// Metric names
pub mod names {
    /// Counter: Volume lifecycle operations by type and status
    pub const OPERATIONS_TOTAL: &str = "csi_volume_operations_total";
    /// Histogram: Duration of volume lifecycle operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "csi_volume_operation_duration_seconds";
    /// Counter: Plugin calls retried after a transient error
    pub const PLUGIN_RETRIES_TOTAL: &str = "csi_volume_plugin_retries_total";
    /// Gauge: Usages currently tracked by this manager, staged or in flight
    pub const TRACKED_USAGES: &str = "csi_volume_tracked_usages";
}

/// Record a volume operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a retry of a plugin call
pub fn record_retry(operation: &str) {
    counter!(names::PLUGIN_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record the number of tracked usages
pub fn set_tracked_usages(count: usize) {
    gauge!(names::TRACKED_USAGES).set(count as f64);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    pub fn failure(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, status, duration);
    }

    /// Finish with the outcome of `result`.
    pub fn observe<T>(self, result: &crate::error::Result<T>) {
        match result {
            Ok(_) => self.success(),
            Err(e) if e.is_transient() => self.failure("transient_error"),
            Err(_) => self.failure("error"),
        }
    }
}
