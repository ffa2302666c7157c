//! Metrics collection and exposition.

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::scanner::Decision;

/// Install the Prometheus exporter and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        tracing::error!(error = %e, "failed to install Prometheus recorder");
        return;
    }
    tracing::info!("metrics server listening on http://{}", addr);
}

/// Record a completed scan and its verdict.
pub fn record_scan(endpoint: &str, decision: Decision) {
    let labels = [
        ("endpoint", endpoint.to_string()),
        ("decision", decision.as_str().to_string()),
    ];
    counter!("stronghold_scans_total", &labels).increment(1);
}

/// Record a settlement outcome ("success", "retry_success", "retry_failure").
pub fn record_settlement(outcome: &str) {
    counter!("stronghold_settlements_total", "outcome" => outcome.to_string()).increment(1);
}
