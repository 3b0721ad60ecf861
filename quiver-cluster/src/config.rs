//! Cluster client configuration

use quiver::{ClientConfig, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for a client talking to a replicated deployment
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClusterClientConfig {
    /// Initial addresses used to discover the cluster members
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Settings shared with the single-node client
    #[serde(default)]
    pub client: ClientConfig,

    /// Retry budget for failover
    #[serde(default)]
    pub failsafe: FailsafeConfig,
}

impl ClusterClientConfig {
    pub fn new(addresses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(Error::Config(
                "At least one cluster address is required".to_string(),
            ));
        }
        if self.failsafe.primary_max_attempts == 0 || self.failsafe.fetch_replicas_max_attempts == 0
        {
            return Err(Error::Config(
                "Failsafe attempt budgets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry budget for the failsafe strategies
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailsafeConfig {
    /// Attempts against the primary replica before giving up
    #[serde(default = "default_primary_max_attempts")]
    pub primary_max_attempts: usize,

    /// Discovery rounds while waiting for a primary to be elected
    #[serde(default = "default_fetch_replicas_max_attempts")]
    pub fetch_replicas_max_attempts: usize,

    /// Pause between primary attempts and discovery rounds
    #[serde(default = "default_wait_for_primary")]
    pub wait_for_primary_ms: u64,
}

fn default_primary_max_attempts() -> usize {
    10
}

fn default_fetch_replicas_max_attempts() -> usize {
    10
}

fn default_wait_for_primary() -> u64 {
    2000
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            primary_max_attempts: default_primary_max_attempts(),
            fetch_replicas_max_attempts: default_fetch_replicas_max_attempts(),
            wait_for_primary_ms: default_wait_for_primary(),
        }
    }
}

impl FailsafeConfig {
    pub fn wait_for_primary(&self) -> Duration {
        Duration::from_millis(self.wait_for_primary_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_failsafe_defaults() {
        let config = FailsafeConfig::default();
        assert_eq!(config.primary_max_attempts, 10);
        assert_eq!(config.fetch_replicas_max_attempts, 10);
        assert_eq!(config.wait_for_primary(), Duration::from_secs(2));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
addresses = ["10.0.0.1:1729", "10.0.0.2:1729"]

[client]
pulse_interval_ms = 1000

[failsafe]
wait_for_primary_ms = 50
"#
        )
        .unwrap();

        let config = ClusterClientConfig::load(file.path()).unwrap();
        assert_eq!(config.addresses.len(), 2);
        assert_eq!(config.client.pulse_interval_ms, 1000);
        assert_eq!(config.client.dispatch_interval_ms, 3);
        assert_eq!(config.failsafe.wait_for_primary_ms, 50);
        assert_eq!(config.failsafe.primary_max_attempts, 10);
    }

    #[test]
    fn test_empty_addresses_rejected() {
        let err = ClusterClientConfig::default().validate().unwrap_err();
        assert_eq!(err.error_type(), "config");
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config = ClusterClientConfig::new(["10.0.0.1:1729"]);
        config.failsafe.primary_max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
