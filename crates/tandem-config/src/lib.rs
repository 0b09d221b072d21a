//! Configuration system for tandem sessions.
//!
//! Provides runtime-configurable sync settings that persist to disk as RON
//! files. Supports CLI overrides via clap, hot-reload detection, and
//! forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, IdConfig, InterpolationMode, NumericWidth, RelayConfig, SessionConfig,
    SyncConfig, WireConfig, allocation_reply_bound, default_config_dir,
};
pub use error::ConfigError;
