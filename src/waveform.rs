//! Stimulation waveform generation.
//!
//! A stimulation request is first planned into a [`Waveform`] and then played
//! on exactly one output line. Three shapes exist:
//!
//! - **Hold**: the line is asserted for the whole window. This covers DC
//!   stimulation (`frequency == 0`) and the degenerate pulse train whose pulse
//!   width fills the whole period, i.e. a train with no gap between pulses.
//! - **Train**: `frequency` pulses per second for `duration` seconds.
//! - **Master8**: one fixed trigger pulse plus settle delay for an external
//!   stimulator, then an idle hold for the rest of the window.
//!
//! The stop signal is checked after every hold increment and after every
//! single pulse. On abort the line is always left at its idle level.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::events::{Event, EventSink};
use crate::hardware::{Level, OutputPins, PinMap};
use crate::protocol::{ExperimentProtocol, OutputChannel, TimingConfig};
use crate::stop::{hold, Outcome, StopSignal};

/// A planned stimulation, ready to be played.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    /// Assert for `duration`, then release.
    Hold {
        /// Time the line stays asserted.
        duration: Duration,
    },
    /// `seconds` repetitions of `pulses_per_second` on/off cycles.
    Train {
        /// Outer repetitions, one per second of stimulation.
        seconds: u32,
        /// Pulses in each repetition.
        pulses_per_second: u32,
        /// Asserted phase of each pulse.
        on: Duration,
        /// Released phase of each pulse.
        off: Duration,
    },
    /// Single Master-8 trigger pulse, settle, then `tail` of idle hold.
    Master8 {
        /// Width of the trigger pulse.
        pulse: Duration,
        /// Settle delay after the pulse.
        settle: Duration,
        /// Remaining stimulation window after pulse and settle.
        tail: Duration,
    },
}

impl Waveform {
    /// Plan the waveform for a protocol's stimulation window.
    pub fn plan(protocol: &ExperimentProtocol, timing: &TimingConfig) -> Self {
        Self::plan_for(
            protocol.output_channel,
            protocol.stim_duration_secs,
            protocol.stim_frequency_hz,
            protocol.pulse_width_ms,
            timing,
        )
    }

    /// Plan a waveform from raw stimulation parameters.
    ///
    /// A train whose off time `1000 / frequency - pulse_width` is at most
    /// `timing.full_width_tolerance_ms` is planned as a hold: every pulse would
    /// run straight into the next one. A negative off time beyond the tolerance
    /// is rejected earlier by [`TimingConfig::check_pulse`]; here it is
    /// clamped into the same hold, as is a width that is not a number.
    pub fn plan_for(
        channel: OutputChannel,
        duration_secs: u32,
        frequency_hz: u32,
        pulse_width_ms: f64,
        timing: &TimingConfig,
    ) -> Self {
        let window = Duration::from_secs(u64::from(duration_secs));

        if channel == OutputChannel::Master8 {
            return Waveform::Master8 {
                pulse: timing.master8_pulse,
                settle: timing.master8_settle,
                tail: Duration::from_secs(u64::from(duration_secs.saturating_sub(1))),
            };
        }

        if frequency_hz == 0 {
            return Waveform::Hold { duration: window };
        }

        let period_ms = 1000.0 / f64::from(frequency_hz);
        let off_ms = period_ms - pulse_width_ms;
        if !off_ms.is_finite() || off_ms <= timing.full_width_tolerance_ms {
            return Waveform::Hold { duration: window };
        }

        Waveform::Train {
            seconds: duration_secs,
            pulses_per_second: frequency_hz,
            on: from_ms(pulse_width_ms.max(0.0)),
            off: from_ms(off_ms),
        }
    }
}

/// Milliseconds to a duration, rounded to the nanosecond.
fn from_ms(ms: f64) -> Duration {
    Duration::from_nanos((ms * 1_000_000.0).round() as u64)
}

/// Plays planned waveforms on the stimulation outputs.
///
/// Only the line belonging to the requested channel is ever written.
#[derive(Clone)]
pub struct WaveformGenerator {
    outputs: Arc<dyn OutputPins>,
    pins: PinMap,
    timing: TimingConfig,
    events: EventSink,
}

impl WaveformGenerator {
    /// Create a generator writing through `outputs`.
    pub fn new(
        outputs: Arc<dyn OutputPins>,
        pins: PinMap,
        timing: TimingConfig,
        events: EventSink,
    ) -> Self {
        Self {
            outputs,
            pins,
            timing,
            events,
        }
    }

    /// Plan and play one stimulation burst.
    ///
    /// Pulse parameters that could not be played are rejected with a
    /// validation error before any line is touched.
    pub async fn fire(
        &self,
        channel: OutputChannel,
        duration_secs: u32,
        frequency_hz: u32,
        pulse_width_ms: f64,
        stop: &StopSignal,
    ) -> AppResult<Outcome> {
        if channel != OutputChannel::Master8 {
            self.timing.check_pulse(frequency_hz, pulse_width_ms)?;
        }
        let waveform = Waveform::plan_for(
            channel,
            duration_secs,
            frequency_hz,
            pulse_width_ms,
            &self.timing,
        );
        self.play(channel, &waveform, stop).await
    }

    /// Play an already planned waveform on `channel`.
    ///
    /// Emits `StimOn` before the first level change and `StimOff` once the
    /// active window is over. An aborted waveform emits no `StimOff`; the
    /// caller reports the abort.
    pub async fn play(
        &self,
        channel: OutputChannel,
        waveform: &Waveform,
        stop: &StopSignal,
    ) -> AppResult<Outcome> {
        let pin = self.pins.stim_pin(channel);
        let active = channel.active_level();
        let idle = channel.idle_level();

        info!(?channel, pin, ?waveform, "stimulation on");
        self.events.emit(Event::StimOn);

        let outcome = match self.drive(pin, active, idle, waveform, stop).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(release) = self.outputs.set_level(pin, idle) {
                    warn!(pin, error = %release, "could not release stimulation line");
                }
                return Err(e);
            }
        };

        match outcome {
            Outcome::Completed => {
                info!(?channel, "stimulation off");
                self.events.emit(Event::StimOff);
            }
            Outcome::Aborted => warn!(?channel, "stimulation aborted"),
        }
        Ok(outcome)
    }

    async fn drive(
        &self,
        pin: u8,
        active: Level,
        idle: Level,
        waveform: &Waveform,
        stop: &StopSignal,
    ) -> AppResult<Outcome> {
        match *waveform {
            Waveform::Hold { duration } => {
                self.outputs.set_level(pin, active)?;
                let outcome = hold(duration, self.timing.hold_increment, stop).await;
                self.outputs.set_level(pin, idle)?;
                Ok(outcome)
            }
            Waveform::Train {
                seconds,
                pulses_per_second,
                on,
                off,
            } => {
                let pacer = self.timing.pacer();
                let mut deadline = Instant::now();
                for second in 0..seconds {
                    for _ in 0..pulses_per_second {
                        self.outputs.set_level(pin, active)?;
                        deadline += on;
                        pacer.wait_until(deadline).await?;
                        self.outputs.set_level(pin, idle)?;
                        deadline += off;
                        pacer.wait_until(deadline).await?;

                        if stop.is_set() {
                            return Ok(Outcome::Aborted);
                        }
                    }
                    debug!(second = second + 1, seconds, "pulse train progress");
                }
                Ok(Outcome::Completed)
            }
            Waveform::Master8 {
                pulse,
                settle,
                tail,
            } => {
                self.outputs.set_level(pin, active)?;
                sleep(pulse).await;
                self.outputs.set_level(pin, idle)?;
                sleep(settle).await;

                if stop.is_set() {
                    Ok(Outcome::Aborted)
                } else {
                    Ok(hold(tail, self.timing.hold_increment, stop).await)
                }
            }
        }
    }
}
