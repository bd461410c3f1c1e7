//! Daemon configuration.
//!
//! Loaded from a YAML file; every field has a default so a partial (or
//! missing) file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Kernel items per dispatch cycle, and entries per auxiliary queue.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Capacity of the learned-MAC and FDB-aging queues.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_route_lookup_timeout")]
    pub route_lookup_timeout_ms: u64,

    /// UDP port for VXLAN links that do not name one.
    #[serde(default = "default_vxlan_udp_port")]
    pub vxlan_udp_port: u16,

    #[serde(default = "default_tunnel_ttl")]
    pub tunnel_ttl: u8,

    /// Push spanning-tree state to the hardware.
    #[serde(default = "default_stp_enabled")]
    pub stp_enabled: bool,
}

fn default_batch_size() -> usize {
    64
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_route_lookup_timeout() -> u64 {
    2000
}

fn default_vxlan_udp_port() -> u16 {
    4789
}

fn default_tunnel_ttl() -> u8 {
    45
}

fn default_stp_enabled() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            route_lookup_timeout_ms: default_route_lookup_timeout(),
            vxlan_udp_port: default_vxlan_udp_port(),
            tunnel_ttl: default_tunnel_ttl(),
            stp_enabled: default_stp_enabled(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(path, &content)
    }

    pub fn route_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.route_lookup_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".to_string()));
        }
        if self.vxlan_udp_port == 0 {
            return Err(ConfigError::Invalid("vxlan_udp_port must be > 0".to_string()));
        }
        if self.tunnel_ttl == 0 {
            return Err(ConfigError::Invalid("tunnel_ttl must be > 0".to_string()));
        }
        Ok(())
    }
}
