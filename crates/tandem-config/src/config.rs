//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Session membership settings.
    pub session: SessionConfig,
    /// Delta-send thresholds and interpolation.
    pub sync: SyncConfig,
    /// Wire encoding settings.
    pub wire: WireConfig,
    /// Entity id pool settings.
    pub ids: IdConfig,
    /// TCP relay settings.
    pub relay: RelayConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Session membership configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Peer that answers id-allocation and spawn requests.
    pub authority_peer: u32,
}

/// How inbound remote state is applied to a local entity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum InterpolationMode {
    /// Apply received poses directly.
    None,
    /// Blend towards received poses over a fixed number of local ticks.
    #[default]
    Step,
}

/// Delta-send and interpolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum position change (world units) that marks an entity dirty.
    pub position_threshold: f32,
    /// Minimum rotation change (degrees) that marks an entity dirty.
    pub rotation_threshold_deg: f32,
    /// Minimum scale change that marks an entity dirty.
    pub scale_threshold: f32,
    /// Smoothing applied to inbound state.
    pub interpolation: InterpolationMode,
    /// Interpolation steps at the base tick rate.
    pub base_step: u32,
    /// Local update rate in Hz, used to scale the interpolation step count.
    pub local_tick_rate: f32,
}

/// Width of the numeric block in transform packets.
///
/// This is a session-wide invariant: every peer must use the same width,
/// nothing on the wire says which one was used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NumericWidth {
    /// IEEE binary32.
    Float32,
    /// IEEE binary16.
    Float16,
}

impl NumericWidth {
    /// Width selected at build time by the `half-precision` feature.
    pub const fn build_default() -> Self {
        if cfg!(feature = "half-precision") {
            Self::Float16
        } else {
            Self::Float32
        }
    }

    /// Bytes used by one encoded value.
    pub const fn bytes_per_value(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 => 2,
        }
    }
}

impl Default for NumericWidth {
    fn default() -> Self {
        Self::build_default()
    }
}

/// Wire encoding configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WireConfig {
    /// Numeric width of pose values.
    pub numeric_width: NumericWidth,
}

/// Entity id pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdConfig {
    /// Number of ids requested from the authority per refill.
    pub refill_batch: u32,
    /// Ticks a deferred allocation may wait before it fails.
    pub allocation_timeout_ticks: u32,
    /// Most ids the authority issues for one request. Larger requests are truncated.
    pub max_request: u32,
}

/// TCP relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay host address.
    pub address: String,
    /// Relay port.
    pub port: u16,
    /// Largest frame accepted from or sent to the relay, in bytes.
    pub max_frame_size: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

/// Largest inbound packet answering an id request of `count`: a 13-byte
/// header, a varint length, and a varint of at most 5 bytes per id.
pub fn allocation_reply_bound(count: u32) -> u64 {
    13 + 5 + 5 * u64::from(count)
}

// --- Default implementations ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self { authority_peer: 0 }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            position_threshold: 0.001,
            rotation_threshold_deg: 0.5,
            scale_threshold: 0.001,
            interpolation: InterpolationMode::Step,
            base_step: 4,
            local_tick_rate: 60.0,
        }
    }
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            refill_batch: 16,
            allocation_timeout_ticks: 600,
            max_request: 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7777,
            max_frame_size: 65_536,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform config directory for tandem (`<config_dir>/tandem`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("tandem"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Check ranges the sync layer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        let thresholds = [
            ("sync.position_threshold", sync.position_threshold),
            ("sync.rotation_threshold_deg", sync.rotation_threshold_deg),
            ("sync.scale_threshold", sync.scale_threshold),
        ];
        for (field, value) in thresholds {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a finite, non-negative number",
                });
            }
        }
        if !(sync.local_tick_rate.is_finite() && sync.local_tick_rate > 0.0) {
            return Err(ConfigError::Invalid {
                field: "sync.local_tick_rate",
                reason: "must be positive",
            });
        }
        if self.ids.refill_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "ids.refill_batch",
                reason: "must be at least 1",
            });
        }
        if self.relay.max_frame_size < 64 {
            return Err(ConfigError::Invalid {
                field: "relay.max_frame_size",
                reason: "must hold at least one packet header",
            });
        }
        if self.ids.max_request < self.ids.refill_batch {
            return Err(ConfigError::Invalid {
                field: "ids.max_request",
                reason: "must be at least ids.refill_batch",
            });
        }
        if allocation_reply_bound(self.ids.max_request) > u64::from(self.relay.max_frame_size) {
            return Err(ConfigError::Invalid {
                field: "ids.max_request",
                reason: "reply would exceed relay.max_frame_size",
            });
        }
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
