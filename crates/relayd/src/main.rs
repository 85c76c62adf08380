//! relayd: the relaygrid daemon.
//!
//! One binary, three ways to run it:
//! - `standalone`: registry API, sweeper and gateway in one process
//! - `registry`: only the service directory and its REST API
//! - `gateway`: only the gateway, resolving instances from a remote registry
//!
//! # Usage
//!
//! ```text
//! relayd --config relaygrid.toml standalone
//! relayd --config relaygrid.toml registry --listen 0.0.0.0:8070
//! relayd --config relaygrid.toml gateway --registry-url http://registry:8070
//! ```

mod modes;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use relaygrid_core::GatewayConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "relayd", about = "relaygrid registry and gateway daemon")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Registry and gateway in one process.
    Standalone {
        /// Gateway listen address.
        #[arg(long)]
        gateway_listen: Option<SocketAddr>,

        /// Registry API listen address.
        #[arg(long)]
        registry_listen: Option<SocketAddr>,
    },

    /// Service registry only.
    Registry {
        /// Registry API listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Gateway only, backed by a remote registry.
    Gateway {
        /// Base URL of the registry, e.g. `http://127.0.0.1:8070`.
        #[arg(long)]
        registry_url: String,

        /// Gateway listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,relayd=debug,relaygrid=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<GatewayConfig> {
    match path {
        Some(path) => {
            let config = GatewayConfig::from_file(path)?;
            info!(path = %path.display(), routes = config.routes.len(), "configuration loaded");
            Ok(config)
        }
        None => {
            info!("no configuration file given, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Standalone {
            gateway_listen,
            registry_listen,
        } => {
            if let Some(addr) = gateway_listen {
                config.server.gateway_listen = addr;
            }
            if let Some(addr) = registry_listen {
                config.server.registry_listen = addr;
            }
            modes::run_standalone(config).await
        }
        Command::Registry { listen } => {
            if let Some(addr) = listen {
                config.server.registry_listen = addr;
            }
            modes::run_registry(config).await
        }
        Command::Gateway {
            registry_url,
            listen,
        } => {
            if let Some(addr) = listen {
                config.server.gateway_listen = addr;
            }
            modes::run_gateway(config, &registry_url).await
        }
    }
}
