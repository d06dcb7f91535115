//! Metrics collection and export for Duet.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "duet_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "duet_connections_active";
    pub const EVENTS_TOTAL: &str = "duet_events_total";
    pub const FRAMES_BYTES: &str = "duet_frames_bytes";
    pub const USERS_ONLINE: &str = "duet_users_online";
    pub const DISPATCH_SECONDS: &str = "duet_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "duet_errors_total";
}

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
        names::EVENTS_TOTAL,
        "Total number of events by name and direction"
    );
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames by direction");
    metrics::describe_gauge!(names::USERS_ONLINE, "Current number of online users");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Time spent handling one inbound event"
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

/// Record an event crossing the gateway.
pub fn record_event(event: &'static str, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
}

/// Record frame bytes.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how long one inbound event took to handle.
pub fn record_dispatch(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Update the online user count.
pub fn set_users_online(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
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
