use anyhow::{Context, Result};
use polltunnel_relay::config::RelayConfig;
use polltunnel_relay::filter::TunnelFilter;
use polltunnel_relay::server::TunnelServer;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("polltunnel_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env().context("Invalid relay configuration")?;

    let server = TunnelServer::with_config(Arc::new(config.opener()?), config.server)?;
    let filter = TunnelFilter::new(config.matcher()?, Arc::new(server));
    let app = polltunnel_relay::app(filter);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(
        "PollTunnel Relay on {} (path: {}, target: {}, secured: {})",
        addr,
        config.tunnel_path,
        config.target,
        config.secret.is_some()
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;
    Ok(())
}
