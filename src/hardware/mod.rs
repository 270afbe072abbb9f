//! Hardware seams: trigger input, digital outputs and the pin assignment.
//!
//! Pin numbers are never global. A [`PinMap`] is part of the validated
//! configuration and is injected into every worker that touches a line.

pub mod capabilities;
pub mod mock;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub use capabilities::{EdgeEvent, EdgeSource, Level, OutputPins};

use crate::error::{AppResult, StimError};
use crate::protocol::OutputChannel;

/// Maximum number of illumination channels on the rig.
pub const MAX_LED_CHANNELS: usize = 4;

/// Board pin assignment for every line the controller uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinMap {
    /// Imaging frame trigger input.
    pub trigger_in: u8,
    /// Stimulation output with inverted polarity (laser driver).
    pub inverted: u8,
    /// Stimulation output with normal polarity.
    pub normal: u8,
    /// Trigger output for a Master-8 pulse stimulator.
    pub master8: u8,
    /// Illumination outputs, in channel order.
    pub leds: Vec<u8>,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            trigger_in: 11,
            inverted: 13,
            normal: 15,
            master8: 19,
            leds: vec![21, 23, 29, 31],
        }
    }
}

impl PinMap {
    /// Output pin for a stimulation channel.
    pub fn stim_pin(&self, channel: OutputChannel) -> u8 {
        match channel {
            OutputChannel::Master8 => self.master8,
            OutputChannel::Inverted => self.inverted,
            OutputChannel::Normal => self.normal,
        }
    }

    /// Reject assignments that would let two functions share a line.
    pub fn validate(&self) -> AppResult<()> {
        if self.leds.len() > MAX_LED_CHANNELS {
            return Err(StimError::Validation(format!(
                "at most {} illumination pins are supported, got {}",
                MAX_LED_CHANNELS,
                self.leds.len()
            )));
        }

        let mut all = vec![self.trigger_in, self.inverted, self.normal, self.master8];
        all.extend(&self.leds);
        let mut seen = all.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != all.len() {
            return Err(StimError::Validation(format!(
                "pin assignment uses a pin more than once: {:?}",
                all
            )));
        }
        Ok(())
    }
}

/// Everything a run needs to talk to the rig.
pub struct Rig {
    /// Imaging trigger input, owned by the worker that counts frames.
    pub trigger: Box<dyn EdgeSource>,
    /// Shared output driver.
    pub outputs: Arc<dyn OutputPins>,
    /// Pin assignment.
    pub pins: PinMap,
}

/// Drive every output to its idle level.
///
/// Master-8 and normal stimulation idle low, inverted stimulation idles high,
/// illumination idles low.
pub fn park_outputs(outputs: &dyn OutputPins, pins: &PinMap) -> AppResult<()> {
    debug!("parking outputs at idle levels");
    for channel in [
        OutputChannel::Master8,
        OutputChannel::Normal,
        OutputChannel::Inverted,
    ] {
        outputs.set_level(pins.stim_pin(channel), channel.idle_level())?;
    }
    for &pin in &pins.leds {
        outputs.set_level(pin, Level::Low)?;
    }
    Ok(())
}
