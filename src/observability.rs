use std::net::SocketAddr;

use crate::request::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: action, status.
pub const REQUESTS_TOTAL: &str = "slotd_requests_total";

/// Histogram: request latency in seconds. Labels: action.
pub const REQUEST_DURATION_SECONDS: &str = "slotd_request_duration_seconds";

// ── Computation ─────────────────────────────────────────────────

/// Histogram: time to compute a full availability window, in seconds.
pub const WINDOW_COMPUTE_DURATION_SECONDS: &str = "slotd_window_compute_duration_seconds";

/// Counter: slots produced by fresh computations.
pub const SLOTS_GENERATED_TOTAL: &str = "slotd_slots_generated_total";

/// Counter: busy-source lookups that failed.
pub const BUSY_SOURCE_ERRORS_TOTAL: &str = "slotd_busy_source_errors_total";

// ── Cache ───────────────────────────────────────────────────────

/// Counter: cache reads. Labels: outcome (hit, miss).
pub const CACHE_READS_TOTAL: &str = "slotd_cache_reads_total";

/// Gauge: slots held in a cache entry. Labels: calendar, job_type.
pub const CACHED_SLOTS: &str = "slotd_cached_slots";

/// Counter: single-slot invalidations applied.
pub const SLOT_INVALIDATIONS_TOTAL: &str = "slotd_slot_invalidations_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Request variant to a short label for metrics.
pub fn action_label(request: &Request) -> &'static str {
    match request {
        Request::Read(read) if read.load_all => "read_window",
        Request::Read(read) if read.date.is_some() => "read_date",
        Request::Read(_) => "read_window",
        Request::Invalidate(_) => "invalidate",
    }
}
