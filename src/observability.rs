use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtbook_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations created. Labels: status (pending or confirmed).
pub const RESERVATIONS_CREATED_TOTAL: &str = "courtbook_reservations_created_total";

/// Counter: reservation attempts refused. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "courtbook_booking_rejections_total";

/// Counter: applied status transitions. Labels: status.
pub const STATUS_CHANGES_TOTAL: &str = "courtbook_status_changes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtbook_connections_rejected_total";

/// Gauge: facilities with a loaded engine.
pub const FACILITIES_ACTIVE: &str = "courtbook_facilities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCoach { .. } => "insert_coach",
        Command::DeleteCoach { .. } => "delete_coach",
        Command::InsertWeeklyHours { .. } => "insert_weekly_hours",
        Command::DeleteWeeklyHours { .. } => "delete_weekly_hours",
        Command::InsertTicket { .. } => "insert_ticket",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertStatusUpdate { .. } => "insert_status_update",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectWeeklyHours { .. } => "select_weekly_hours",
        Command::SelectTickets { .. } => "select_tickets",
        Command::SelectCoaches => "select_coaches",
    }
}
