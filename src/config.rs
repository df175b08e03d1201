//! Registry configuration
//!
//! Configuration is supplied programmatically by the process bootstrap
//! or loaded from a TOML document. Every field has a default so a bare
//! `[network]`-less document is valid.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RosterError, RosterResult};
use crate::types::CanonicalAddress;

/// Top-level configuration for a registry node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    /// Display name for this server, unique within the cluster
    pub name: String,
    /// Placement tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Cache size reported in process metadata, in megabytes
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u64,
    /// Process instance generation override. When unset, the generation
    /// is derived from the process start time in epoch milliseconds,
    /// which is monotone across restarts of the same server.
    #[serde(default)]
    pub generation: Option<u64>,
    /// Advertised network configuration
    #[serde(default)]
    pub network: NetworkOptions,
    /// Peer link tuning
    #[serde(default)]
    pub link: LinkConfig,
}

impl RosterConfig {
    /// Configuration with defaults for everything but the name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            cache_size_mb: default_cache_size_mb(),
            generation: None,
            network: NetworkOptions::default(),
            link: LinkConfig::default(),
        }
    }

    /// Load configuration from a TOML document
    pub fn from_toml_str(content: &str) -> RosterResult<Self> {
        toml::from_str(content)
            .map_err(|e| RosterError::Config(format!("failed to parse configuration: {}", e)))
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> RosterResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| RosterError::Config(format!("failed to read configuration: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> RosterResult<()> {
        if self.name.is_empty() {
            return Err(RosterError::Config("server name must not be empty".into()));
        }
        self.link.validate()
    }
}

/// Advertised network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOptions {
    /// Hostname advertised to peers
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Address the cluster listener binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Client driver port
    #[serde(default = "default_reql_port")]
    pub reql_port: u16,
    /// Intra-cluster port the registry listens on; 0 binds an ephemeral
    /// port which is advertised once known
    #[serde(default)]
    pub cluster_port: u16,
    /// Administrative HTTP port advertised in the record
    #[serde(default = "default_http_admin_port")]
    pub http_admin_port: u16,
    /// Canonical addresses advertised to peers. When empty, a single
    /// hostname:cluster_port entry is derived after the listener binds.
    #[serde(default)]
    pub canonical_addresses: Vec<CanonicalAddress>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_host: default_bind_host(),
            reql_port: default_reql_port(),
            cluster_port: 0,
            http_admin_port: default_http_admin_port(),
            canonical_addresses: Vec::new(),
        }
    }
}

/// Peer link tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Milliseconds between outgoing heartbeats
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Milliseconds of silence before a link is declared lost. Must be
    /// strictly greater than the heartbeat interval so ordinary jitter
    /// does not look like a disconnect.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Maximum frame size accepted on the wire, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl LinkConfig {
    /// Interval between outgoing heartbeats
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence span after which the link is declared lost
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Validate the tuning values
    pub fn validate(&self) -> RosterResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(RosterError::Config(
                "heartbeat interval must be greater than zero".into(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(RosterError::Config(format!(
                "heartbeat timeout ({} ms) must be strictly greater than the heartbeat \
                 interval ({} ms)",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(RosterError::Config(
                "maximum frame size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_cache_size_mb() -> u64 {
    512
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_reql_port() -> u16 {
    28015
}

fn default_http_admin_port() -> u16 {
    8080
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5000
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024 // 1MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RosterConfig::named("a");
        assert!(config.validate().is_ok());
        assert!(config.link.heartbeat_timeout() > config.link.heartbeat_interval());
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let config = RosterConfig::named("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_not_above_interval_is_rejected() {
        let mut config = RosterConfig::named("a");
        config.link.heartbeat_timeout_ms = config.link.heartbeat_interval_ms;
        assert!(config.validate().is_err());

        config.link.heartbeat_timeout_ms = config.link.heartbeat_interval_ms + 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let doc = r#"
            name = "b"
            tags = ["foo", "bar"]
            cache_size_mb = 256

            [network]
            hostname = "node-2"
            cluster_port = 29015

            [link]
            heartbeat_interval_ms = 500
            heartbeat_timeout_ms = 2500
        "#;

        let config = RosterConfig::from_toml_str(doc).unwrap();
        assert_eq!(config.name, "b");
        assert_eq!(config.tags, vec!["foo".to_string(), "bar".to_string()]);
        assert_eq!(config.cache_size_mb, 256);
        assert_eq!(config.network.hostname, "node-2");
        assert_eq!(config.network.cluster_port, 29015);
        assert_eq!(config.network.reql_port, 28015);
        assert_eq!(config.link.heartbeat_interval_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = RosterConfig::from_toml_str("name = \"a\"").unwrap();
        assert_eq!(config.cache_size_mb, 512);
        assert_eq!(config.network.cluster_port, 0);
        assert!(config.generation.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_toml_is_a_config_error() {
        let result = RosterConfig::from_toml_str("name = ");
        assert!(matches!(result, Err(RosterError::Config(_))));
    }
}
