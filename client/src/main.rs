use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polltunnel::client::is_port_available;
use polltunnel::config::{ClientConfig, SecretConfig, TunnelConfig};
use polltunnel::multi::TunnelManager;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "polltunnel")]
#[command(author = "PollTunnel Team")]
#[command(version = "0.1.0")]
#[command(about = "Tunnel local TCP connections to a remote service over HTTP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Tunnel one local port to a relay URL
    Connect {
        /// Relay tunnel URL, e.g. http://example.com/tunnel
        url: String,

        /// Local port to listen on
        #[arg(short = 'p', long, default_value_t = 8000)]
        local_port: u16,

        /// Header carrying the shared secret
        #[arg(long, requires = "secret")]
        secret_header: Option<String>,

        /// Shared secret value
        #[arg(long, requires = "secret_header")]
        secret: Option<String>,
    },
    /// Start every tunnel defined in a config file
    Up {
        /// Path to polltunnel.yml (searched for when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "polltunnel=debug"
    } else {
        "polltunnel=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match cli.command {
        Commands::Connect {
            url,
            local_port,
            secret_header,
            secret,
        } => {
            let secret = match (secret_header, secret) {
                (Some(header), Some(value)) => Some(SecretConfig { header, value }),
                _ => None,
            };
            let config = ClientConfig {
                tunnels: vec![TunnelConfig {
                    name: "default".to_string(),
                    url,
                    local_port,
                    local_host: "127.0.0.1".to_string(),
                    secret,
                }],
            };
            config.validate()?;
            config
        }
        Commands::Up { config } => {
            let path = config
                .or_else(ClientConfig::find_config)
                .context("No config file given and none of polltunnel.yml / .polltunnel.yml found")?;
            ClientConfig::load(&path)?
        }
    };

    for tunnel in &config.tunnels {
        if tunnel.local_host == "127.0.0.1" && !is_port_available(tunnel.local_port) {
            anyhow::bail!(
                "Local port {} for tunnel '{}' is already in use",
                tunnel.local_port,
                tunnel.name
            );
        }
    }

    let mut manager = TunnelManager::new(config);
    manager.start_all().await?;
    manager.wait_for_shutdown().await;

    Ok(())
}
