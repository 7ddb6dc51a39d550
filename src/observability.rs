use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "allocd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "allocd_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "allocd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "allocd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "allocd_connections_rejected_total";

/// Gauge: live change-event subscriptions.
pub const SUBSCRIBERS_ACTIVE: &str = "allocd_subscribers_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "allocd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "allocd_wal_flush_batch_size";

// ── Bulk execution ──────────────────────────────────────────────

/// Counter: chunks committed.
pub const CHUNKS_COMMITTED_TOTAL: &str = "allocd_chunks_committed_total";

/// Counter: chunks rolled back.
pub const CHUNKS_ROLLED_BACK_TOTAL: &str = "allocd_chunks_rolled_back_total";

/// Counter: bulk operations finished. Labels: status.
pub const BULK_OPERATIONS_TOTAL: &str = "allocd_bulk_operations_total";

/// Counter: conflicts detected. Labels: kind.
pub const CONFLICTS_DETECTED_TOTAL: &str = "allocd_conflicts_detected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Request variant to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::BulkCreate { options, .. } if options.run_async => "bulk_create_async",
        Request::BulkCreate { .. } => "bulk_create",
        Request::BulkUpdate { options, .. } if options.run_async => "bulk_update_async",
        Request::BulkUpdate { .. } => "bulk_update",
        Request::BulkDelete { options, .. } if options.run_async => "bulk_delete_async",
        Request::BulkDelete { .. } => "bulk_delete",
        Request::BulkCopy { options, .. } if options.run_async => "bulk_copy_async",
        Request::BulkCopy { .. } => "bulk_copy",
        Request::ValidateCreate { .. } => "validate_create",
        Request::ValidateUpdate { .. } => "validate_update",
        Request::ValidateDelete { .. } => "validate_delete",
        Request::ValidateCopy { .. } => "validate_copy",
        Request::OperationStatus { .. } => "operation_status",
        Request::CancelOperation { .. } => "cancel_operation",
        Request::OperationHistory { .. } => "operation_history",
        Request::OperationResult { .. } => "operation_result",
        Request::GetAllocation { .. } => "get_allocation",
        Request::ListAllocations { .. } => "list_allocations",
        Request::UpsertEmployee { .. } => "upsert_employee",
        Request::RemoveEmployee { .. } => "remove_employee",
        Request::UpsertProject { .. } => "upsert_project",
        Request::RemoveProject { .. } => "remove_project",
        Request::RecordTimeEntry { .. } => "record_time_entry",
        Request::Subscribe { .. } => "subscribe",
    }
}
