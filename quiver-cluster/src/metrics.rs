//! Cluster failover metrics

/// Record a failsafe retry (strategy: primary, any; reason: error type)
pub fn record_failsafe_retry(strategy: &str, reason: &str) {
    metrics::counter!(
        "quiver_failsafe_retries_total",
        "strategy" => strategy.to_string(),
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record a failsafe task that ran out of replicas or attempts
pub fn record_failsafe_exhausted(strategy: &str) {
    metrics::counter!(
        "quiver_failsafe_exhausted_total",
        "strategy" => strategy.to_string(),
    )
    .increment(1);
}

/// Record a replica discovery outcome (ok, unreachable, error, no_primary)
pub fn record_discovery(outcome: &str) {
    metrics::counter!(
        "quiver_replica_discovery_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Update the known cluster members gauge
pub fn record_cluster_members(count: usize) {
    metrics::gauge!("quiver_cluster_members").set(count as f64);
}
