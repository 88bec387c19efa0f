//! Beacon Signal Server
//!
//! Rendezvous and relay server for peer discovery and connection signaling.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, or the platform config file if present
//! beacon-signal
//!
//! # Port from the environment
//! PORT=9000 beacon-signal
//!
//! # Explicit config file
//! beacon-signal --config /etc/beacon/config.toml
//!
//! # Write the effective configuration and exit
//! beacon-signal --port 9000 --init-config
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beacon_core::Config;
use beacon_signal::{CredentialStore, SignalServer};

#[derive(Parser, Debug)]
#[command(name = "beacon-signal")]
#[command(about = "Beacon rendezvous server for peer discovery and signaling relay")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Configuration file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::sample());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    if args.init_config {
        let path = args
            .config
            .clone()
            .or_else(Config::default_path)
            .ok_or("no config directory available, pass --config")?;
        config.save_to(&path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    info!("Starting Beacon Signal Server");
    info!(
        "Idle timeout {}s, sweep every {}s",
        config.liveness.idle_timeout_secs,
        config.liveness.sweep_interval().as_secs()
    );

    let credentials_path = config.credentials_path();
    info!("Using credential store {:?}", credentials_path);
    let credentials = CredentialStore::open(&credentials_path)?;

    let server = SignalServer::new(&config, credentials);
    server.serve(config.server.socket_addr()).await?;

    Ok(())
}
