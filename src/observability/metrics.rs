//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): forwarded HTTP requests by method, status
//! - `proxy_request_duration_seconds` (histogram): HTTP round-trip latency
//! - `proxy_upstream_errors_total` (counter): failed dials and round trips by phase
//! - `proxy_websocket_sessions_total` (counter): finished sessions by outcome
//! - `proxy_websocket_sessions_active` (gauge): sessions between dial and close
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with a scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    let labels = [("method", method.to_string()), ("status", status.to_string())];
    metrics::counter!("proxy_requests_total", &labels).increment(1);
    metrics::histogram!("proxy_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(phase: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "phase" => phase).increment(1);
}

pub fn session_opened() {
    metrics::gauge!("proxy_websocket_sessions_active").increment(1.0);
}

pub fn session_closed() {
    metrics::gauge!("proxy_websocket_sessions_active").decrement(1.0);
}

pub fn record_session_outcome(outcome: &'static str) {
    metrics::counter!("proxy_websocket_sessions_total", "outcome" => outcome).increment(1);
}
