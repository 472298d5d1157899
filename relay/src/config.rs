//! Relay configuration from environment variables

use polltunnel_shared::{Error, Result};
use std::sync::Arc;
use tokio::time::Duration;

use crate::matcher::{PathMatcher, RequestMatcher, SecuredMatcher};
use crate::server::ServerConfig;
use crate::target::SocketTargetOpener;

/// Settings consumed when the relay starts
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP listen port
    pub port: u16,
    /// Path that carries tunnel traffic
    pub tunnel_path: String,
    /// Target address as `host:port`
    pub target: String,
    /// Optional shared secret as (header name, value)
    pub secret: Option<(String, String)>,
    pub server: ServerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tunnel_path: "/tunnel".to_string(),
            target: "127.0.0.1:8000".to_string(),
            secret: None,
            server: ServerConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let port = match lookup("PORT") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT '{}'", v)))?,
            None => defaults.port,
        };

        let secret = match (lookup("TUNNEL_SECRET_HEADER"), lookup("TUNNEL_SECRET")) {
            (Some(header), Some(secret)) => Some((header, secret)),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "TUNNEL_SECRET_HEADER and TUNNEL_SECRET must be set together".into(),
                ))
            }
        };

        let config = Self {
            port,
            tunnel_path: lookup("TUNNEL_PATH").unwrap_or(defaults.tunnel_path),
            target: lookup("TUNNEL_TARGET").unwrap_or(defaults.target),
            secret,
            server: ServerConfig {
                long_poll_timeout: millis(&lookup, "TUNNEL_LONG_POLL_MS")?
                    .unwrap_or(defaults.server.long_poll_timeout),
                disconnect_timeout: millis(&lookup, "TUNNEL_DISCONNECT_MS")?
                    .unwrap_or(defaults.server.disconnect_timeout),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.tunnel_path.starts_with('/') {
            return Err(Error::Config(format!(
                "TUNNEL_PATH '{}' must start with '/'",
                self.tunnel_path
            )));
        }
        if SocketTargetOpener::from_address(&self.target).is_none() {
            return Err(Error::Config(format!(
                "TUNNEL_TARGET '{}' is not host:port",
                self.target
            )));
        }
        self.server.validate()
    }

    pub fn matcher(&self) -> Result<Arc<dyn RequestMatcher>> {
        Ok(match &self.secret {
            Some((header, secret)) => {
                Arc::new(SecuredMatcher::new(self.tunnel_path.clone(), header, secret.clone())?)
            }
            None => Arc::new(PathMatcher::new(self.tunnel_path.clone())?),
        })
    }

    pub fn opener(&self) -> Result<SocketTargetOpener> {
        SocketTargetOpener::from_address(&self.target)
            .ok_or_else(|| Error::Config(format!("invalid target '{}'", self.target)))
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    lookup(key)
        .map(|v| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| Error::Config(format!("invalid {} '{}'", key, v)))
        })
        .transpose()
}
