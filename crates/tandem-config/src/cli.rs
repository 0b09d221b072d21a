//! Command-line argument parsing for tandem binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tandem command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Tandem shared-session relay")]
pub struct CliArgs {
    /// Relay bind/connect address.
    #[arg(long)]
    pub address: Option<String>,

    /// Relay port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Peer that answers id-allocation requests.
    #[arg(long)]
    pub authority_peer: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.address {
            self.relay.address = addr.clone();
        }
        if let Some(port) = args.port {
            self.relay.port = port;
        }
        if let Some(peer) = args.authority_peer {
            self.session.authority_peer = peer;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            address: None,
            port: None,
            authority_peer: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(9000),
            log_level: Some("debug".to_string()),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.relay.address, "127.0.0.1");
        assert_eq!(config.session.authority_peer, 0);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args =
            CliArgs::try_parse_from(["tandem", "--port", "8123", "--authority-peer", "2"]).unwrap();
        assert_eq!(args.port, Some(8123));
        assert_eq!(args.authority_peer, Some(2));
    }
}
