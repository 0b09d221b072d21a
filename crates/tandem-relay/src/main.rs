//! Relay entry point: accepts peer connections and forwards their packets.
//!
//! Run with: `cargo run -p tandem-relay -- --port 7777`

use std::net::{AddrParseError, IpAddr, SocketAddr};

use clap::Parser;
use tandem_config::{CliArgs, Config, default_config_dir};
use tandem_net::{FrameConfig, RelayServer, RelayServerConfig};
use tracing::{error, info};

/// Bind address and frame limits from the relay section of `config`.
fn server_config(config: &Config) -> Result<RelayServerConfig, AddrParseError> {
    let ip: IpAddr = config.relay.address.parse()?;
    Ok(RelayServerConfig {
        bind_addr: SocketAddr::new(ip, config.relay.port),
        frames: FrameConfig::from(&config.relay),
    })
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => Some(dir),
        None => default_config_dir().ok(),
    };

    let mut config = match config_dir.as_deref() {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    tandem_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(2);
    }

    let server_config = match server_config(&config) {
        Ok(server_config) => server_config,
        Err(e) => {
            error!("Invalid relay address {:?}: {e}", config.relay.address);
            std::process::exit(2);
        }
    };
    info!(
        "Tandem relay on {} (max frame {} bytes)",
        server_config.bind_addr, server_config.frames.max_frame_size
    );

    let server = RelayServer::new(server_config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
