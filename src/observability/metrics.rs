//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, upstream latency, decisions, reloads)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status, route kind
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_upstream_requests_total` (counter): upstream calls by destination, status
//! - `gateway_upstream_request_duration_seconds` (histogram): upstream latency
//! - `gateway_authorize_decisions_total` (counter): allow / deny / error
//! - `gateway_reloads_total` (counter): routing table reloads by outcome
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Status 0 marks an upstream call that never produced a response

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record a request handled by the gateway.
pub fn record_request(method: &str, status: u16, route: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("route", route.to_string()),
    ];
    metrics::counter!("gateway_requests_total", &labels).increment(1);
    metrics::histogram!("gateway_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

/// Record a call to an upstream destination.
pub fn record_upstream(destination: &str, method: &str, status: u16, start: Instant) {
    let labels = [
        ("destination", destination.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!("gateway_upstream_requests_total", &labels).increment(1);
    metrics::histogram!("gateway_upstream_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_authorization(decision: &'static str) {
    metrics::counter!("gateway_authorize_decisions_total", "decision" => decision).increment(1);
}

pub fn record_reload(outcome: &'static str) {
    metrics::counter!("gateway_reloads_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_harmless() {
        let start = Instant::now();
        record_request("GET", 200, "policy", start);
        record_upstream("app.internal", "GET", 0, start);
        record_authorization("allow");
        record_reload("success");
    }
}
