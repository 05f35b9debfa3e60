use std::net::SocketAddr;
use std::time::Instant;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "voltbay_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "voltbay_op_duration_seconds";

/// Counter: operations rejected before commit. Labels: op, code.
pub const REJECTIONS_TOTAL: &str = "voltbay_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: day shards currently loaded.
pub const DAYS_ACTIVE: &str = "voltbay_days_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "voltbay_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "voltbay_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if `None`.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Record one orchestrator operation: count, latency, and the rejection
/// code when it failed.
pub(crate) fn record_op(op: &'static str, started: Instant, code: Option<&'static str>) {
    let status = if code.is_none() { "ok" } else { "rejected" };
    metrics::counter!(OPS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OP_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    if let Some(code) = code {
        metrics::counter!(REJECTIONS_TOTAL, "op" => op, "code" => code).increment(1);
    }
}
