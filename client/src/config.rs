//! Configuration file parser for the tunnel client
//!
//! Supports polltunnel.yml with one entry per local port to tunnel.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::connection::HttpTunnelConnection;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel definitions
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Single tunnel definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Human-readable name
    pub name: String,

    /// Relay tunnel URL, e.g. `http://relay.example.com/tunnel`
    pub url: String,

    /// Local port to listen on
    pub local_port: u16,

    /// Local interface to bind (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Shared secret header expected by the relay
    pub secret: Option<SecretConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretConfig {
    pub header: String,
    pub value: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tunnels.is_empty() {
            anyhow::bail!("No tunnels defined in configuration");
        }

        let mut ports = std::collections::HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.name.is_empty() {
                anyhow::bail!("Tunnel name cannot be empty");
            }
            if tunnel.local_port == 0 {
                anyhow::bail!("Invalid port 0 for tunnel '{}'", tunnel.name);
            }
            if !ports.insert((tunnel.local_host.as_str(), tunnel.local_port)) {
                anyhow::bail!(
                    "Tunnel '{}' reuses local port {}",
                    tunnel.name,
                    tunnel.local_port
                );
            }
            tunnel
                .connection()
                .with_context(|| format!("Invalid tunnel '{}'", tunnel.name))?;
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "polltunnel.yml",
            "polltunnel.yaml",
            ".polltunnel.yml",
            ".polltunnel.yaml",
        ];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

impl TunnelConfig {
    /// Build the HTTP connection described by this entry
    pub fn connection(&self) -> Result<HttpTunnelConnection> {
        let mut connection = HttpTunnelConnection::new(&self.url)?;
        if let Some(secret) = &self.secret {
            connection = connection.with_header(&secret.header, &secret.value)?;
        }
        Ok(connection)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        (self.local_host.as_str(), self.local_port)
            .to_socket_addrs()
            .with_context(|| format!("Unable to resolve '{}'", self.local_host))?
            .next()
            .with_context(|| format!("No address for '{}'", self.local_host))
    }
}
