//! Timed trial sequence.
//!
//! Plays `trial_count` trials on wall-clock time rather than counted frames:
//! an off period of `off_frames` seconds, then per trial one stimulation window
//! followed by the rest of the `frames_per_trial` second trial. The sequence can
//! either start immediately or hold until the first trigger edge.

use std::time::Duration;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::events::{Event, EventSink};
use crate::hardware::{EdgeEvent, EdgeSource};
use crate::protocol::{ExperimentProtocol, TimingConfig};
use crate::stop::{hold, Outcome, StopSignal};
use crate::waveform::{Waveform, WaveformGenerator};

/// How the sequence synchronises its start.
pub enum StartMode {
    /// Hold until one rising edge arrives on this trigger line.
    WaitForTrigger(Box<dyn EdgeSource>),
    /// Start as soon as the sequence runs.
    FreeRunning,
}

/// Drives a fixed number of stimulation trials.
pub struct TrialSequencer {
    start: StartMode,
    protocol: ExperimentProtocol,
    waveform: Waveform,
    timing: TimingConfig,
    generator: WaveformGenerator,
    events: EventSink,
    stop: StopSignal,
}

impl TrialSequencer {
    /// Build a sequencer; the waveform is planned once up front.
    pub fn new(
        start: StartMode,
        protocol: ExperimentProtocol,
        timing: TimingConfig,
        generator: WaveformGenerator,
        events: EventSink,
        stop: StopSignal,
    ) -> Self {
        let waveform = Waveform::plan(&protocol, &timing);
        Self {
            start,
            protocol,
            waveform,
            timing,
            generator,
            events,
            stop,
        }
    }

    /// Run every trial, or stop at the first checkpoint after an abort.
    ///
    /// Emits `Finished` on completion or `ForceStopped` on abort, never both.
    pub async fn run(&mut self) -> AppResult<Outcome> {
        let outcome = self.play().await?;
        match outcome {
            Outcome::Completed => {
                info!(trials = self.protocol.trial_count, "trial sequence finished");
                self.events.emit(Event::Finished);
            }
            Outcome::Aborted => {
                warn!("trial sequence force stopped");
                self.events.emit(Event::ForceStopped);
            }
        }
        Ok(outcome)
    }

    async fn play(&mut self) -> AppResult<Outcome> {
        if self.await_start().await?.is_aborted() {
            return Ok(Outcome::Aborted);
        }

        let increment = self.timing.hold_increment;
        let off = secs(self.protocol.off_frames);
        if hold(off, increment, &self.stop).await.is_aborted() {
            return Ok(Outcome::Aborted);
        }

        let rest = secs(
            self.protocol
                .frames_per_trial
                .saturating_sub(self.protocol.active_window_secs()),
        );

        for trial in 1..=self.protocol.trial_count {
            info!(trial, of = self.protocol.trial_count, "trial");
            self.events.emit(Event::TrialNumber(trial));

            let stim = self
                .generator
                .play(self.protocol.output_channel, &self.waveform, &self.stop)
                .await?;
            if stim.is_aborted() {
                return Ok(Outcome::Aborted);
            }

            if hold(rest, increment, &self.stop).await.is_aborted() {
                return Ok(Outcome::Aborted);
            }
        }

        Ok(Outcome::Completed)
    }

    async fn await_start(&mut self) -> AppResult<Outcome> {
        if let StartMode::WaitForTrigger(trigger) = &mut self.start {
            info!("waiting for trigger to start trial sequence");
            loop {
                match trigger.wait_for_rising_edge(self.timing.edge_timeout).await? {
                    EdgeEvent::Detected => break,
                    EdgeEvent::Timeout if self.stop.is_set() => return Ok(Outcome::Aborted),
                    EdgeEvent::Timeout => {}
                }
            }
        }

        info!("experiment started");
        self.events.emit(Event::ExperimentStarted);
        Ok(Outcome::Completed)
    }
}

fn secs(n: u32) -> Duration {
    Duration::from_secs(u64::from(n))
}
