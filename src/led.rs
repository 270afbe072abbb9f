//! Round-robin illumination for multi-wavelength imaging.
//!
//! Each imaging frame lights exactly one of the enabled illumination channels
//! for that channel's configured period, cycling through them in configuration
//! order. Frame 1 only advances the cursor: illumination has not started yet
//! when the first trigger edge arrives.
//!
//! Periods are in microseconds, so the hold goes through a [`Pacer`] rather
//! than a plain timer sleep.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppResult, StimError};
use crate::hardware::{Level, OutputPins, PinMap};
use crate::pacing::Pacer;
use crate::stop::{Outcome, StopSignal};

/// One illumination channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedChannelConfig {
    /// Whether the channel takes part in the rotation.
    pub enabled: bool,
    /// On time per frame in microseconds.
    pub period_us: u64,
}

/// Illumination channels, in pin order of [`PinMap::leds`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    /// Per-channel settings.
    pub channels: Vec<LedChannelConfig>,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                LedChannelConfig {
                    enabled: false,
                    period_us: 1000,
                };
                4
            ],
        }
    }
}

impl LedConfig {
    /// Every configured channel needs a pin, and enabled ones a non-zero period.
    pub fn validate(&self, pins: &PinMap) -> AppResult<()> {
        if self.channels.len() > pins.leds.len() {
            return Err(StimError::Validation(format!(
                "{} illumination channels configured but only {} pins assigned",
                self.channels.len(),
                pins.leds.len()
            )));
        }
        if let Some(i) = self
            .channels
            .iter()
            .position(|c| c.enabled && c.period_us == 0)
        {
            return Err(StimError::Validation(format!(
                "illumination channel {} is enabled with a zero period",
                i + 1
            )));
        }
        Ok(())
    }
}

/// Fires one enabled illumination channel per frame.
pub struct LedScheduler {
    channels: Vec<(u8, Duration)>,
    cursor: usize,
    outputs: Arc<dyn OutputPins>,
    pacer: Pacer,
    stop: StopSignal,
}

impl LedScheduler {
    /// Collect the enabled channels in order, pairing each with its pin.
    pub fn new(
        config: &LedConfig,
        pins: &PinMap,
        outputs: Arc<dyn OutputPins>,
        pacer: Pacer,
        stop: StopSignal,
    ) -> Self {
        let channels: Vec<(u8, Duration)> = config
            .channels
            .iter()
            .zip(&pins.leds)
            .filter(|(c, _)| c.enabled)
            .map(|(c, &pin)| (pin, Duration::from_micros(c.period_us)))
            .collect();
        info!(enabled = channels.len(), "illumination scheduler ready");

        Self {
            channels,
            cursor: 0,
            outputs,
            pacer,
            stop,
        }
    }

    /// Pins in rotation order.
    pub fn enabled_pins(&self) -> Vec<u8> {
        self.channels.iter().map(|(pin, _)| *pin).collect()
    }

    /// Index of the channel the next frame will light.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Handle one imaging frame.
    ///
    /// The hold is not interruptible; the stop signal is looked at once it
    /// is over.
    pub async fn on_frame(&mut self, frame: u64) -> AppResult<Outcome> {
        let Some(&(pin, period)) = self.channels.get(self.cursor) else {
            return Ok(Outcome::Completed);
        };

        if frame != 1 {
            debug!(frame, pin, ?period, "illumination pulse");
            self.outputs.set_level(pin, Level::High)?;
            let held = self.pacer.wait(period).await;
            self.outputs.set_level(pin, Level::Low)?;
            held?;
        }

        self.cursor = (self.cursor + 1) % self.channels.len();

        if self.stop.is_set() {
            return Ok(Outcome::Aborted);
        }
        Ok(Outcome::Completed)
    }
}
