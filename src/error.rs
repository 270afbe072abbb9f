//! Custom error types for the stimulation controller.
//!
//! This module defines the primary error type, `StimError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single place for the ways a run can
//! fail before or while it touches the hardware.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically a malformed TOML file or
//!   an environment override that does not deserialize.
//! - **`MissingConfig`**: An explicitly requested configuration file does not exist.
//! - **`Validation`**: Semantic errors in the protocol or rig configuration, such as
//!   a stimulation window longer than the trial window or a pulse width that leaves
//!   a negative inter-pulse gap. These are always raised before a run starts.
//! - **`Hardware`**: A failure reported by an edge source or an output pin driver.
//! - **`Worker`**: A worker task that panicked or was cancelled by the runtime.
//! - **`Logging`**: The global subscriber could not be installed.
//!
//! A user abort and a stalled trigger line are *not* errors. They are reported as
//! outcomes (see [`crate::session::RunOutcome`]) so that callers can tell a clean
//! early exit apart from a fault.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, StimError>;

/// Errors raised while configuring or driving a stimulation run.
#[derive(Error, Debug)]
pub enum StimError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration file not found: {}", .0.display())]
    MissingConfig(PathBuf),

    #[error("Configuration serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl From<figment::Error> for StimError {
    fn from(err: figment::Error) -> Self {
        StimError::Config(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for StimError {
    fn from(err: tokio::task::JoinError) -> Self {
        StimError::Worker(err.to_string())
    }
}
