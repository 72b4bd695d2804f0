//! Metrics helpers
//!
//! Thin wrappers over the `metrics` facade so call sites stay terse and the
//! metric names live in one place. A recorder is installed (or not) by the
//! embedding application; without one these are no-ops.

use std::time::Duration;

/// Counter helpers
pub mod counters {
    use metrics::counter;

    /// A connection attempt started
    pub fn connect_attempted() {
        counter!("kafka_conn_connect_attempts_total").increment(1);
    }

    /// A connection reached the connected state
    pub fn connect_established() {
        counter!("kafka_conn_connects_established_total").increment(1);
    }

    /// A connection attempt failed
    pub fn connect_failed() {
        counter!("kafka_conn_connect_failures_total").increment(1);
    }

    /// An in-progress attempt exceeded the connection timeout
    pub fn connect_timeout() {
        counter!("kafka_conn_connect_timeouts_total").increment(1);
    }

    /// An authentication handshake started
    pub fn auth_attempted(mechanism: &str) {
        counter!("kafka_conn_auth_attempts_total", "mechanism" => mechanism.to_string())
            .increment(1);
    }

    /// An authentication handshake completed
    pub fn auth_successful(mechanism: &str) {
        counter!("kafka_conn_auth_successes_total", "mechanism" => mechanism.to_string())
            .increment(1);
    }

    /// An authentication handshake failed
    pub fn auth_failed(mechanism: &str) {
        counter!("kafka_conn_auth_failures_total", "mechanism" => mechanism.to_string())
            .increment(1);
    }

    /// A request frame was accepted for sending
    pub fn request_sent() {
        counter!("kafka_conn_requests_sent_total").increment(1);
    }

    /// A response was matched to its in-flight request
    pub fn response_received() {
        counter!("kafka_conn_responses_received_total").increment(1);
    }

    /// In-flight requests failed by a disconnect or close
    pub fn in_flight_failed(count: u64) {
        counter!("kafka_conn_in_flight_failed_total").increment(count);
    }
}

/// Histogram helpers
pub mod histograms {
    use super::Duration;
    use metrics::histogram;

    /// Wall time from attempt start to the connected state
    pub fn connect_duration(elapsed: Duration) {
        histogram!("kafka_conn_connect_duration_ms").record(elapsed.as_millis() as f64);
    }

    /// Wall time spent in the authenticating state
    pub fn auth_duration(mechanism: &str, elapsed: Duration) {
        histogram!("kafka_conn_auth_duration_ms", "mechanism" => mechanism.to_string())
            .record(elapsed.as_millis() as f64);
    }
}
