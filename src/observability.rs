use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "daybook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "daybook_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations created. Labels: kind (booking | hold).
pub const RESERVATIONS_CREATED_TOTAL: &str = "daybook_reservations_created_total";

/// Counter: requests rejected by the conflict check. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "daybook_conflicts_total";

/// Counter: confirmed → cancelled transitions.
pub const CANCELLATIONS_TOTAL: &str = "daybook_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "daybook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "daybook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "daybook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "daybook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "daybook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertHold { .. } => "insert_hold",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectHealth => "select_health",
    }
}
