//! Metrics collection and export for groupcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use groupcast_core::RelayStats;
use groupcast_transport::{FrameReader, FrameWriter, Transport, TransportError};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "groupcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "groupcast_connections_active";
    pub const MESSAGES_TOTAL: &str = "groupcast_messages_total";
    pub const MESSAGES_BYTES: &str = "groupcast_messages_bytes";
    pub const MESSAGES_DROPPED: &str = "groupcast_messages_dropped_total";
    pub const GROUPS_ACTIVE: &str = "groupcast_groups_active";
    pub const ERRORS_TOTAL: &str = "groupcast_errors_total";
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
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames moved");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames moved");
    metrics::describe_counter!(
        names::MESSAGES_DROPPED,
        "Messages dropped because a member's outbound queue was full"
    );
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of live groups");
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

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Publish relay-wide figures.
pub fn record_relay_stats(stats: &RelayStats) {
    gauge!(names::GROUPS_ACTIVE).set(stats.groups as f64);
    counter!(names::MESSAGES_DROPPED).absolute(stats.dropped_messages);
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

/// A transport that counts the frames passing through it.
pub struct MeteredTransport<T> {
    inner: T,
}

impl<T: Transport> MeteredTransport<T> {
    /// Wrap a transport.
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T: Transport> Transport for MeteredTransport<T> {
    type Reader = MeteredReader<T::Reader>;
    type Writer = MeteredWriter<T::Writer>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = self.inner.split();
        (MeteredReader { inner: reader }, MeteredWriter { inner: writer })
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Inbound half of a [`MeteredTransport`].
pub struct MeteredReader<R> {
    inner: R,
}

#[async_trait]
impl<R: FrameReader> FrameReader for MeteredReader<R> {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        let result = self.inner.read_frame().await;
        match &result {
            Ok(frame) => record_message(frame.len(), "inbound"),
            Err(e) if !e.is_expected_close() => record_error("transport"),
            Err(_) => {}
        }
        result
    }
}

/// Outbound half of a [`MeteredTransport`].
pub struct MeteredWriter<W> {
    inner: W,
}

#[async_trait]
impl<W: FrameWriter> FrameWriter for MeteredWriter<W> {
    async fn write_frame(&mut self, payload: String) -> Result<(), TransportError> {
        let len = payload.len();
        self.inner.write_frame(payload).await?;
        record_message(len, "outbound");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
