//! Metrics collection and exposition.
//!
//! # Metrics
//! - `stream_created_total` (counter): streams opened, by protocol and role
//! - `stream_reset_total` (counter): resets by reason
//! - `stream_active` (gauge): streams tracked by stream connections
//! - `filter_stop_total` (counter): stop verdicts by direction and status
//! - `watermark_events_total` (counter): watermark edges by scope and edge
//! - `connection_active` (gauge): open transport connections
//! - `goaway_total` (counter): GoAway frames sent or received
//! - `local_reply_total` (counter): streams answered by a filter, by reason
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Label values are static strings, never per-stream identifiers

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::stream::StreamResetReason;

/// Install the Prometheus exporter with an HTTP scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_stream_created(protocol: &'static str, role: &'static str) {
    metrics::counter!("stream_created_total", "protocol" => protocol, "role" => role).increment(1);
    metrics::gauge!("stream_active").increment(1.0);
}

pub fn record_stream_closed() {
    metrics::gauge!("stream_active").decrement(1.0);
}

pub fn record_stream_reset(reason: StreamResetReason) {
    metrics::counter!("stream_reset_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_filter_stop(direction: &'static str, status: &'static str) {
    metrics::counter!("filter_stop_total", "direction" => direction, "status" => status).increment(1);
}

/// `scope` is one of `connection`, `filter`; `edge` is `above` or `below`.
pub fn record_watermark_event(scope: &'static str, edge: &'static str) {
    metrics::counter!("watermark_events_total", "scope" => scope, "edge" => edge).increment(1);
}

pub fn record_connection_opened() {
    metrics::gauge!("connection_active").increment(1.0);
}

pub fn record_connection_closed() {
    metrics::gauge!("connection_active").decrement(1.0);
}

pub fn record_go_away(direction: &'static str) {
    metrics::counter!("goaway_total", "direction" => direction).increment(1);
}

pub fn record_local_reply(reason: &'static str) {
    metrics::counter!("local_reply_total", "reason" => reason).increment(1);
}
