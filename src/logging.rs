//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AppResult, StimError};

/// Install the global subscriber, writing to stderr.
///
/// Fails if the level is not a valid filter directive or a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| StimError::Logging(format!("invalid level {:?}: {e}", config.level)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| StimError::Logging(e.to_string()))
}
