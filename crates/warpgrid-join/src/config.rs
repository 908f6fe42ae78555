//! join.toml configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::server::DEFAULT_STREAM_BUFFER;

/// Settings for a join authority.
///
/// Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Address the join gRPC server binds.
    pub listen_addr: SocketAddr,
    /// Organization written into issued certificates.
    pub cluster_name: String,
    /// Upper bound on a whole join handshake.
    pub max_join_duration_secs: u64,
    /// Longest certificate lifetime a node may request.
    pub max_cert_ttl_secs: u64,
    /// Capacity of the per-stream request and response channels.
    pub stream_buffer: usize,
    /// Peers allowed to relay joins and supply `ProxySuppliedParameters`.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 3025)),
            cluster_name: "warpgrid".to_string(),
            max_join_duration_secs: 60,
            max_cert_ttl_secs: 86_400,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            trusted_proxies: Vec::new(),
        }
    }
}

impl JoinConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: JoinConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would make every join fail.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster_name.trim().is_empty() {
            anyhow::bail!("cluster_name must not be empty");
        }
        if self.max_join_duration_secs == 0 {
            anyhow::bail!("max_join_duration_secs must be greater than zero");
        }
        if self.max_cert_ttl_secs == 0 {
            anyhow::bail!("max_cert_ttl_secs must be greater than zero");
        }
        if self.stream_buffer == 0 {
            anyhow::bail!("stream_buffer must be greater than zero");
        }
        Ok(())
    }

    pub fn max_join_duration(&self) -> Duration {
        Duration::from_secs(self.max_join_duration_secs)
    }

    pub fn max_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.max_cert_ttl_secs)
    }
}
