//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the rig's standard pin assignment and timing)
//! 2. A TOML file (explicit path, or `<config dir>/stim_sync/config.toml` if present)
//! 3. Environment variables prefixed with `STIM_SYNC_`, `__` separating sections
//!
//! # Environment Variable Overrides
//!
//! ```text
//! STIM_SYNC_PROTOCOL__TRIAL_COUNT=12
//! STIM_SYNC_PROTOCOL__OUTPUT_CHANNEL=inverted
//! STIM_SYNC_TIMING__EDGE_TIMEOUT=500ms
//! STIM_SYNC_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use stim_sync::config::AppConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     println!("Trials: {}", config.protocol.trial_count);
//!     println!("Edge timeout: {:?}", config.timing.edge_timeout);
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, StimError};
use crate::hardware::PinMap;
use crate::led::LedConfig;
use crate::protocol::{ExperimentProtocol, TimingConfig};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "STIM_SYNC_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Experiment protocol for the run.
    pub protocol: ExperimentProtocol,
    /// Polling, cancellation and pulse-shape timing.
    pub timing: TimingConfig,
    /// Board pin assignment.
    pub pins: PinMap,
    /// Illumination channels.
    pub leds: LedConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter (trace, debug, info, warn, error); `RUST_LOG` wins.
    pub level: String,
    /// Emit JSON lines instead of human readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load and validate the layered configuration.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let file = match path {
            Some(p) if !p.exists() => return Err(StimError::MissingConfig(p.to_path_buf())),
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "loading configuration file");
            figment = figment.merge(Toml::file(file));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Parse and validate configuration from TOML text over the defaults.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()));
        Self::extract(figment.merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Run every construction-time consistency check.
    pub fn validate(&self) -> AppResult<()> {
        self.timing.validate()?;
        self.protocol.validate(&self.timing)?;
        self.pins.validate()?;
        self.leds.validate(&self.pins)?;
        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// `<config dir>/stim_sync/config.toml`, if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("stim_sync").join("config.toml"))
        .filter(|p| p.exists())
}
