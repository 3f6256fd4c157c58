use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "cottage_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "cottage_request_duration_seconds";

/// Counter: reservations admitted.
pub const RESERVATIONS_ADMITTED_TOTAL: &str = "cottage_reservations_admitted_total";

/// Counter: admissions or edits rejected for overlapping an existing stay.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "cottage_reservation_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "cottage_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "cottage_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "cottage_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cottage_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cottage_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
/// A failed install is logged and the ledger runs without metrics.
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

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::CreateCottage { .. } => "create_cottage",
        Request::UpdateCottage { .. } => "update_cottage",
        Request::DeleteCottage { .. } => "delete_cottage",
        Request::GetCottage { .. } => "get_cottage",
        Request::ListCottages => "list_cottages",
        Request::CreateAmenity { .. } => "create_amenity",
        Request::UpdateAmenity { .. } => "update_amenity",
        Request::DeleteAmenity { .. } => "delete_amenity",
        Request::GetAmenity { .. } => "get_amenity",
        Request::ListAmenities { .. } => "list_amenities",
        Request::AttachAmenity { .. } => "attach_amenity",
        Request::DetachAmenity { .. } => "detach_amenity",
        Request::CreateReservation { .. } => "create_reservation",
        Request::UpdateReservation { .. } => "update_reservation",
        Request::CancelReservation { .. } => "cancel_reservation",
        Request::GetReservation { .. } => "get_reservation",
        Request::ListReservations { .. } => "list_reservations",
        Request::CheckAvailability { .. } => "check_availability",
        Request::Vacancies { .. } => "vacancies",
        Request::Subscribe { .. } => "subscribe",
        Request::Unsubscribe { .. } => "unsubscribe",
    }
}
