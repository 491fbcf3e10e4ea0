//! Transport instrumentation.
//!
//! Recorded through the `metrics` facade; the server installs the exporter.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const LONGPOLL_SESSIONS_ACTIVE: &str = "herald_longpoll_sessions_active";
    pub const MESSAGES_TOTAL: &str = "herald_messages_total";
    pub const MESSAGES_BYTES: &str = "herald_messages_bytes";
    pub const JOINS_TOTAL: &str = "herald_joins_total";
    pub const CHANNEL_FAULTS_TOTAL: &str = "herald_channel_faults_total";
    pub const LATENCY_SECONDS: &str = "herald_latency_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a join attempt by outcome (`routed`, `unmatched`).
pub fn record_join(outcome: &'static str) {
    counter!(names::JOINS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an abnormal channel exit.
pub fn record_channel_fault() {
    counter!(names::CHANNEL_FAULTS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Records a connection for as long as it is alive.
pub struct ConnectionMetricsGuard {
    gauge: &'static str,
}

impl ConnectionMetricsGuard {
    /// A persistent-socket connection.
    #[must_use]
    pub fn connection() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        Self::track(names::CONNECTIONS_ACTIVE)
    }

    /// A long-poll session.
    #[must_use]
    pub fn longpoll_session() -> Self {
        Self::track(names::LONGPOLL_SESSIONS_ACTIVE)
    }

    fn track(gauge: &'static str) -> Self {
        gauge!(gauge).increment(1.0);
        Self { gauge }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(self.gauge).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        let _conn = ConnectionMetricsGuard::connection();
        let _poll = ConnectionMetricsGuard::longpoll_session();
        record_message(10, "inbound");
        record_join("routed");
        record_channel_fault();
    }
}
