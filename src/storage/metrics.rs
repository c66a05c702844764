//! Shared metrics recording for every adapter.

use crate::Result;
use std::time::Instant;

/// Records operation metrics.
///
/// This function records two metrics for each operation:
/// 1. `storage_operations_total` - Counter for operation count by status
/// 2. `storage_operation_duration_ms` - Histogram for operation latency
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records metrics for a finished operation and passes the result through.
///
/// Errors are logged here, where they are caught, before propagating.
pub fn observe<T>(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    result: Result<T>,
) -> Result<T> {
    match &result {
        Ok(_) => record_operation_metrics(backend, operation, start, "success"),
        Err(e) => {
            tracing::warn!(backend, operation, error = %e, kind = ?e.kind(), "Storage operation failed");
            record_operation_metrics(backend, operation, start, "error");
        },
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_observe_passes_results_through() {
        let start = Instant::now();
        assert_eq!(observe("test", "get", start, Ok(3)).unwrap(), 3);
        let err = observe::<()>("test", "get", start, Err(Error::backend("get", "test", "boom")));
        assert!(err.is_err());
    }
}
