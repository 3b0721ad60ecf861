//! Client observability metrics
//!
//! Prometheus-compatible metrics for:
//! - RPC duration and errors per server
//! - Connection establishment
//! - Transaction request batching
//! - Session lifecycle and heartbeats

use std::time::{Duration, Instant};

/// Record RPC call duration
pub fn record_rpc_duration(method: &str, target_node: &str, duration: Duration) {
    metrics::histogram!(
        "quiver_rpc_duration_seconds",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record RPC call success
pub fn record_rpc_success(method: &str, target_node: &str) {
    metrics::counter!(
        "quiver_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record RPC call error
pub fn record_rpc_error(method: &str, target_node: &str, error_type: &str) {
    metrics::counter!(
        "quiver_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "quiver_rpc_errors_total",
        "method" => method.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record connection establishment
pub fn record_connection_established(target_node: &str) {
    metrics::counter!(
        "quiver_connections_established_total",
        "target_node" => target_node.to_string(),
    )
    .increment(1);
}

/// Record connection failure
pub fn record_connection_failed(target_node: &str, error_type: &str) {
    metrics::counter!(
        "quiver_connections_failed_total",
        "target_node" => target_node.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record connection pool size
pub fn record_connection_pool_size(size: usize) {
    metrics::gauge!("quiver_connections_active").set(size as f64);
}

/// Record one frame of transaction requests written to a stream
pub fn record_batch_flushed(batch_size: usize) {
    metrics::counter!("quiver_transaction_frames_total").increment(1);
    metrics::histogram!("quiver_transaction_batch_size").record(batch_size as f64);
}

/// Update the open sessions gauge
pub fn record_open_sessions(count: usize) {
    metrics::gauge!("quiver_sessions_open").set(count as f64);
}

/// Record a session heartbeat outcome (alive, dead, error)
pub fn record_pulse(outcome: &str) {
    metrics::counter!(
        "quiver_session_pulses_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Guard for timing RPC operations
pub struct RpcTimer {
    method: String,
    target_node: String,
    start: Instant,
}

impl RpcTimer {
    /// Start timing an RPC operation
    pub fn new(method: &str, target_node: &str) -> Self {
        Self {
            method: method.to_string(),
            target_node: target_node.to_string(),
            start: Instant::now(),
        }
    }

    /// Time elapsed since the timer started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record success and duration
    pub fn success(self) {
        let duration = self.start.elapsed();
        record_rpc_duration(&self.method, &self.target_node, duration);
        record_rpc_success(&self.method, &self.target_node);
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed();
        record_rpc_duration(&self.method, &self.target_node, duration);
        record_rpc_error(&self.method, &self.target_node, error_type);
    }
}
