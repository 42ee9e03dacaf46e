use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeep_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: bookings committed. Labels: status (initial status).
pub const BOOKINGS_CREATED_TOTAL: &str = "slotkeep_bookings_created_total";

/// Counter: reservation attempts that did not commit. Labels: reason
/// (validation, not_offered, taken, timeout).
pub const RESERVATIONS_REJECTED_TOTAL: &str = "slotkeep_reservations_rejected_total";

/// Histogram: time a reservation waited for its service lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotkeep_lock_wait_seconds";

/// Counter: lifecycle transitions applied. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "slotkeep_status_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeep_connections_rejected_total";

/// Counter: statements refused to a public session. Labels: command.
pub const PERMISSION_DENIED_TOTAL: &str = "slotkeep_permission_denied_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeep_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotkeep_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertWorkspace { .. } => "insert_workspace",
        Command::UpdateWorkspace { .. } => "update_workspace",
        Command::SelectWorkspace { .. } => "select_workspace",
        Command::InsertServiceType { .. } => "insert_service_type",
        Command::UpdateServiceType { .. } => "update_service_type",
        Command::SelectServiceTypes { .. } => "select_service_types",
        Command::InsertRule { .. } => "insert_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::SelectRules { .. } => "select_rules",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectContact { .. } => "select_contact",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
