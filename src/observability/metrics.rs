//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_packets_total` (counter): captured packets by protocol, direction
//! - `proxy_bytes_total` (counter): captured bytes by protocol, direction
//! - `proxy_holds_total` (counter): resolved holds by outcome
//! - `proxy_held_packets` (gauge): packets currently held
//! - `proxy_active_sessions` (gauge): running sessions by protocol
//! - `proxy_session_errors_total` (counter): failed sessions by protocol, kind
//! - `proxy_telemetry_flush_total` (counter): bulk flushes by result

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::protocols::{Direction, ProtocolKind};

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics endpoint"),
    }
}

pub fn record_packet(protocol: ProtocolKind, direction: Direction, bytes: usize) {
    let (protocol, direction) = (protocol.as_str(), direction.as_str());
    counter!("proxy_packets_total", "protocol" => protocol, "direction" => direction).increment(1);
    counter!("proxy_bytes_total", "protocol" => protocol, "direction" => direction)
        .increment(bytes as u64);
}

pub fn record_hold(outcome: &'static str) {
    counter!("proxy_holds_total", "outcome" => outcome).increment(1);
}

pub fn set_held_packets(count: usize) {
    gauge!("proxy_held_packets").set(count as f64);
}

pub fn record_session_started(protocol: ProtocolKind) {
    gauge!("proxy_active_sessions", "protocol" => protocol.as_str()).increment(1.0);
}

pub fn record_session_finished(protocol: ProtocolKind) {
    gauge!("proxy_active_sessions", "protocol" => protocol.as_str()).decrement(1.0);
}

pub fn record_session_error(protocol: ProtocolKind, kind: &'static str) {
    counter!(
        "proxy_session_errors_total",
        "protocol" => protocol.as_str(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_telemetry_flush(result: &'static str) {
    counter!("proxy_telemetry_flush_total", "result" => result).increment(1);
}
