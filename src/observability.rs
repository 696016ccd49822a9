use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "kinedesk_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "kinedesk_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "kinedesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "kinedesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "kinedesk_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kinedesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kinedesk_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: rejected writes. Labels: kind (overlap, insufficient_stock, ...).
pub const CONFLICTS_TOTAL: &str = "kinedesk_conflicts_total";

/// Counter: stock restorations after a failed loan or return. Labels: outcome.
pub const COMPENSATIONS_TOTAL: &str = "kinedesk_compensations_total";

/// Gauge: materials whose counters disagree with their active loans at the last audit.
pub const STOCK_DRIFT_MATERIALS: &str = "kinedesk_stock_drift_materials";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::InsertReschedule { .. } => "insert_reschedule",
        Command::InsertAppointmentStatus { .. } => "insert_appointment_status",
        Command::InsertAppointmentNotes { .. } => "insert_appointment_notes",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectPractitionerDay { .. } => "select_practitioner_day",
        Command::SelectPatientRange { .. } => "select_patient_range",
        Command::InsertMaterial { .. } => "insert_material",
        Command::SelectMaterials { .. } => "select_materials",
        Command::InsertLoan { .. } => "insert_loan",
        Command::InsertReturn { .. } => "insert_return",
        Command::SelectLoans { .. } => "select_loans",
        Command::SelectLoan { .. } => "select_loan",
        Command::SelectStockDrift => "select_stock_drift",
    }
}
