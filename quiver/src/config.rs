//! Client configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for unary RPCs (session open, pulse, discovery)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Interval between session heartbeats
    #[serde(default = "default_pulse_interval")]
    pub pulse_interval_ms: u64,

    /// How long batched transaction requests wait before being flushed
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,

    /// Server name presented during the TLS handshake
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// TLS configuration for the QUIC transport
    #[serde(default)]
    pub tls: ClientTlsConfig,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    30000
}

fn default_pulse_interval() -> u64 {
    5000
}

fn default_dispatch_interval() -> u64 {
    3
}

fn default_server_name() -> String {
    "quiver".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            pulse_interval_ms: default_pulse_interval(),
            dispatch_interval_ms: default_dispatch_interval(),
            server_name: default_server_name(),
            tls: ClientTlsConfig::default(),
        }
    }
}

/// TLS configuration for the client transport
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientTlsConfig {
    /// Path to CA certificate for verifying server certificates.
    /// System roots are used when absent.
    pub ca_cert_path: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE - for development only)
    #[serde(default)]
    pub skip_verify: bool,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {:?}: {}", path, e)))?;
        Ok(toml::from_str(&content)?)
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}
