//! Multi-tunnel manager
//!
//! Starts one local listener per tunnel in the configuration and stops
//! them all together.

use crate::client::{LoggingListener, TunnelClient};
use crate::config::{ClientConfig, TunnelConfig};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Manages the listeners for every configured tunnel
pub struct TunnelManager {
    config: ClientConfig,
    clients: Vec<(String, TunnelClient)>,
}

impl TunnelManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            clients: Vec::new(),
        }
    }

    /// Start all tunnels defined in the configuration. Tunnels already
    /// started are stopped again if a later one fails.
    pub async fn start_all(&mut self) -> Result<Vec<SocketAddr>> {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║  🚀 PollTunnel                                               ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║  Starting {:<3} tunnel(s)...                                  ║", self.config.tunnels.len());
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        let mut bound = Vec::new();
        for conf in self.config.tunnels.clone() {
            match start_tunnel(&conf).await {
                Ok((client, addr)) => {
                    println!("  ✓ {} → {} ↔ {}", conf.name, conf.url, addr);
                    self.clients.push((conf.name.clone(), client));
                    bound.push(addr);
                }
                Err(e) => {
                    self.stop_all().await;
                    return Err(e);
                }
            }
        }

        println!("\nPress Ctrl+C to stop\n");
        Ok(bound)
    }

    pub async fn stop_all(&mut self) {
        for (name, client) in self.clients.drain(..) {
            client.stop().await;
            info!("Tunnel '{}' stopped", name);
        }
    }

    /// Wait for Ctrl+C, then stop every tunnel
    pub async fn wait_for_shutdown(mut self) {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down all tunnels...");
        self.stop_all().await;
        println!("\n✓ All tunnels stopped.");
    }
}

async fn start_tunnel(conf: &TunnelConfig) -> Result<(TunnelClient, SocketAddr)> {
    let mut client = TunnelClient::new(conf.listen_addr()?, conf.connection()?);
    client.add_listener(Arc::new(LoggingListener::new(conf.name.clone())));
    let addr = client
        .start()
        .await
        .with_context(|| format!("Failed to start tunnel '{}'", conf.name))?;
    Ok((client, addr))
}
