//! Metrics collection and export for Roomcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Connection and frame metrics are recorded as
//! they happen; gateway and bridge counters are sampled periodically.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_broker::BridgeStats;
use roomcast_core::{ConnectionGateway, GatewayStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const MESSAGES_TOTAL: &str = "roomcast_messages_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "roomcast_publish_failures_total";
    pub const DELIVERIES_DROPPED_TOTAL: &str = "roomcast_deliveries_dropped_total";
    pub const ENVELOPES_REJECTED_TOTAL: &str = "roomcast_envelopes_rejected_total";
    pub const ENVELOPES_SELF_FILTERED_TOTAL: &str = "roomcast_envelopes_self_filtered_total";
    pub const ROOMS_ACTIVE: &str = "roomcast_rooms_active";
    pub const BRIDGE_RECONNECTS_TOTAL: &str = "roomcast_bridge_reconnects_total";
    pub const HANDLER_FAILURES_TOTAL: &str = "roomcast_handler_failures_total";
    pub const FRAME_LATENCY_SECONDS: &str = "roomcast_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "roomcast_errors_total";
}

/// How often gateway counters are copied into the registry.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Messages by path: inbound, local, fanout, published"
    );
    metrics::describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Envelopes the broker did not accept"
    );
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED_TOTAL,
        "Deliveries dropped because a client's queue was full"
    );
    metrics::describe_counter!(
        names::ENVELOPES_REJECTED_TOTAL,
        "Envelopes from the broker dropped on receive, by reason"
    );
    metrics::describe_counter!(
        names::ENVELOPES_SELF_FILTERED_TOTAL,
        "Own envelopes discarded on receive"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one local member");
    metrics::describe_counter!(
        names::BRIDGE_RECONNECTS_TOTAL,
        "Subscription connection reconnects"
    );
    metrics::describe_counter!(
        names::HANDLER_FAILURES_TOTAL,
        "Subscription handler errors and panics"
    );
    metrics::describe_histogram!(
        names::FRAME_LATENCY_SECONDS,
        "Client frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a client frame.
pub fn record_inbound() {
    counter!(names::MESSAGES_TOTAL, "path" => "inbound").increment(1);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::FRAME_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Copy gateway and bridge counters into the registry.
pub fn record_gateway_stats(stats: &GatewayStats, bridge: &BridgeStats) {
    counter!(names::MESSAGES_TOTAL, "path" => "local").absolute(stats.local_deliveries);
    counter!(names::MESSAGES_TOTAL, "path" => "fanout").absolute(stats.fanout_deliveries);
    counter!(names::MESSAGES_TOTAL, "path" => "published").absolute(stats.published);
    counter!(names::PUBLISH_FAILURES_TOTAL).absolute(stats.publish_failures);
    counter!(names::DELIVERIES_DROPPED_TOTAL).absolute(stats.dropped_deliveries);
    counter!(names::ENVELOPES_SELF_FILTERED_TOTAL).absolute(stats.self_filtered);
    counter!(names::ENVELOPES_REJECTED_TOTAL, "reason" => "malformed")
        .absolute(stats.rejected.malformed);
    counter!(names::ENVELOPES_REJECTED_TOTAL, "reason" => "invalid")
        .absolute(stats.rejected.invalid);
    counter!(names::ENVELOPES_REJECTED_TOTAL, "reason" => "version")
        .absolute(stats.rejected.version);
    gauge!(names::ROOMS_ACTIVE).set(stats.registry.rooms as f64);
    counter!(names::BRIDGE_RECONNECTS_TOTAL).absolute(bridge.reconnects);
    counter!(names::HANDLER_FAILURES_TOTAL).absolute(bridge.handler_failures);
}

/// Sample the gateway every `interval` until the task is aborted.
pub fn spawn_sampler(gateway: Arc<ConnectionGateway>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            record_gateway_stats(&gateway.stats(), &gateway.bridge().stats());
        }
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed: every call is a no-op and must not panic.
        let _guard = ConnectionMetricsGuard::new();
        record_inbound();
        record_error("websocket");
        record_gateway_stats(&GatewayStats::default(), &BridgeStats::default());
    }
}
