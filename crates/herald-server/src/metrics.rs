//! Metrics export for Herald.
//!
//! The transports record through the `metrics` facade; this module describes
//! the metrics and installs the Prometheus exporter.

use anyhow::{Context, Result};
use herald_transport::metrics::names;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of WebSocket connections"
    );
    metrics::describe_gauge!(
        names::LONGPOLL_SESSIONS_ACTIVE,
        "Current number of long-poll sessions"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(names::JOINS_TOTAL, "Join requests by outcome");
    metrics::describe_counter!(
        names::CHANNEL_FAULTS_TOTAL,
        "Channel sessions that exited abnormally"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound message routing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of transport errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
