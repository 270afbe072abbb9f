//! Capability traits for the two hardware seams of the rig.
//!
//! - [`EdgeSource`]: the imaging trigger line, polled with a bounded timeout.
//! - [`OutputPins`]: digital outputs driven by the stimulation and illumination
//!   workers.
//!
//! Both traits are object safe so a run can be wired to real pins or to the
//! simulated devices in [`crate::hardware::mock`] without changing any worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AppResult;

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Line driven to ground.
    Low,
    /// Line driven to the supply rail.
    High,
}

/// Result of a single bounded wait on the trigger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEvent {
    /// A rising edge arrived before the timeout.
    Detected,
    /// The timeout elapsed with no edge.
    Timeout,
}

/// External trigger input (one rising edge per imaging frame).
///
/// A source is owned by exactly one worker for the duration of a run.
#[async_trait]
pub trait EdgeSource: Send {
    /// Wait for the next rising edge, giving up after `timeout`.
    async fn wait_for_rising_edge(&mut self, timeout: Duration) -> AppResult<EdgeEvent>;
}

/// Digital output driver.
///
/// Level changes are treated as instantaneous; all timing is done by the
/// caller with sleeps between calls.
pub trait OutputPins: Send + Sync {
    /// Drive `pin` to `level`.
    fn set_level(&self, pin: u8, level: Level) -> AppResult<()>;
}
