//! Wiring of the timing workers into a complete experiment run.
//!
//! A [`Session`] is one run: it owns a fresh [`StopSignal`], validates the
//! configuration once, parks the outputs, spawns one Tokio task per timing loop
//! and parks the outputs again when every worker has finished.
//!
//! # Frame-synchronised run
//!
//! ```text
//! EdgeSource --> FrameCounter --events--> router --+--> outer EventSink
//!                                                  +--> LED worker (FrameNumber)
//!                                                  +--> stim worker (StimulateNow)
//! ```
//!
//! The stimulation worker is the single consumer of `StimulateNow`; requests
//! queue up behind a running waveform, so two stimulations never overlap on
//! the output line.
//!
//! `Finished` or `ForceStopped` is forwarded only after both workers have
//! returned. A run that times out raises the stop signal first, so a waveform
//! still playing is released to idle without a `StimOff`.
//!
//! # Timed run
//!
//! A [`TrialSequencer`] on its own worker, optionally held until the first
//! trigger edge.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::events::{Event, EventSink};
use crate::frame_counter::{FrameCountOutcome, FrameCounter};
use crate::hardware::{park_outputs, Rig};
use crate::led::LedScheduler;
use crate::protocol::ExperimentProtocol;
use crate::sequencer::{StartMode, TrialSequencer};
use crate::stop::{Outcome, StopSignal};
use crate::waveform::{Waveform, WaveformGenerator};

/// Which timing loop drives the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Count trigger edges and stimulate on scheduled frames.
    FrameSync,
    /// Play trials on wall-clock time.
    Timed,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every frame or trial was played.
    Completed,
    /// The trigger went quiet before the last frame.
    TimedOut,
    /// The stop signal ended the run.
    Aborted,
}

impl From<FrameCountOutcome> for RunOutcome {
    fn from(outcome: FrameCountOutcome) -> Self {
        match outcome {
            FrameCountOutcome::Completed => RunOutcome::Completed,
            FrameCountOutcome::TimedOut => RunOutcome::TimedOut,
            FrameCountOutcome::Aborted => RunOutcome::Aborted,
        }
    }
}

impl From<Outcome> for RunOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => RunOutcome::Completed,
            Outcome::Aborted => RunOutcome::Aborted,
        }
    }
}

/// One experiment run.
pub struct Session {
    config: AppConfig,
    stop: StopSignal,
    run_id: Uuid,
}

impl Session {
    /// Validate `config` and prepare a run.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stop: StopSignal::new(),
            run_id: Uuid::new_v4(),
        })
    }

    /// Handle for the abort action.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Identifier attached to every log line of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Play the run to its end on `rig`, reporting to `events`.
    pub async fn run(self, mode: RunMode, rig: Rig, events: EventSink) -> AppResult<RunOutcome> {
        let span = tracing::info_span!("run", run_id = %self.run_id, ?mode);
        async move {
            let outputs = Arc::clone(&rig.outputs);
            let pins = rig.pins.clone();
            park_outputs(outputs.as_ref(), &pins)?;

            let result = match mode {
                RunMode::FrameSync => self.run_frame_synced(rig, events).await,
                RunMode::Timed => self.run_timed(rig, events).await,
            };

            // Always leave the rig idle, but report the run's own error first.
            let parked = park_outputs(outputs.as_ref(), &pins);
            let outcome = result?;
            parked?;
            info!(?outcome, "run ended");
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn run_frame_synced(&self, rig: Rig, events: EventSink) -> AppResult<RunOutcome> {
        let Rig {
            trigger,
            outputs,
            pins,
        } = rig;
        let protocol = self.config.protocol.clone();
        let timing = self.config.timing.clone();

        let (counter_sink, mut counter_events) = EventSink::channel();
        let mut counter = FrameCounter::new(
            trigger,
            &protocol,
            timing.clone(),
            counter_sink,
            self.stop.clone(),
        );
        let counter_task = spawn_worker("frame counter", &self.stop, async move {
            counter.run().await
        });

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let led = LedScheduler::new(
            &self.config.leds,
            &pins,
            Arc::clone(&outputs),
            timing.pacer(),
            self.stop.clone(),
        );
        let led_task = spawn_worker("illumination", &self.stop, led_worker(led, frame_rx));

        let (stim_tx, stim_rx) = mpsc::unbounded_channel();
        let generator = WaveformGenerator::new(outputs, pins, timing.clone(), events.clone());
        let waveform = Waveform::plan(&protocol, &timing);
        let stim_task = spawn_worker(
            "stimulation",
            &self.stop,
            stim_worker(
                generator,
                protocol,
                waveform,
                self.stop.clone(),
                events.clone(),
                stim_rx,
            ),
        );

        // Ends once the frame counter drops its sink. The terminal event is
        // held back until the workers have let go of the outputs.
        let mut terminal = None;
        while let Some(event) = counter_events.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
                continue;
            }
            events.emit(event);
            match event {
                Event::FrameNumber(frame) => {
                    let _ = frame_tx.send(frame);
                }
                Event::StimulateNow => {
                    let _ = stim_tx.send(());
                }
                _ => {}
            }
        }
        drop(frame_tx);
        drop(stim_tx);

        let counted = counter_task.await?;
        if let Ok(FrameCountOutcome::TimedOut) = counted {
            warn!("trigger went quiet, cancelling stimulation in progress");
            self.stop.trigger();
        }
        let lit = led_task.await?;
        let stimulated = stim_task.await?;
        if let Some(event) = terminal {
            events.emit(event);
        }

        let outcome = counted?;
        lit?;
        stimulated?;
        Ok(outcome.into())
    }

    async fn run_timed(&self, rig: Rig, events: EventSink) -> AppResult<RunOutcome> {
        let Rig {
            trigger,
            outputs,
            pins,
        } = rig;
        let protocol = self.config.protocol.clone();
        let timing = self.config.timing.clone();

        let start = if protocol.wait_for_trigger {
            StartMode::WaitForTrigger(trigger)
        } else {
            StartMode::FreeRunning
        };
        let generator = WaveformGenerator::new(outputs, pins, timing.clone(), events.clone());
        let mut sequencer =
            TrialSequencer::new(start, protocol, timing, generator, events, self.stop.clone());

        let task = spawn_worker("trial sequencer", &self.stop, async move {
            sequencer.run().await
        });
        Ok(task.await??.into())
    }
}

/// Spawn a worker task that raises the stop signal when it fails.
fn spawn_worker<T, F>(name: &'static str, stop: &StopSignal, fut: F) -> JoinHandle<AppResult<T>>
where
    T: Send + 'static,
    F: Future<Output = AppResult<T>> + Send + 'static,
{
    let stop = stop.clone();
    tokio::spawn(
        async move {
            let result = fut.await;
            if let Err(e) = &result {
                error!(worker = name, error = %e, "worker failed, stopping run");
                stop.trigger();
            }
            result
        }
        .in_current_span(),
    )
}

async fn led_worker(
    mut led: LedScheduler,
    mut frames: mpsc::UnboundedReceiver<u64>,
) -> AppResult<()> {
    while let Some(frame) = frames.recv().await {
        if led.on_frame(frame).await?.is_aborted() {
            break;
        }
    }
    Ok(())
}

/// Plays one trial's stimulation per `StimulateNow`, strictly one at a time.
async fn stim_worker(
    generator: WaveformGenerator,
    protocol: ExperimentProtocol,
    waveform: Waveform,
    stop: StopSignal,
    events: EventSink,
    mut requests: mpsc::UnboundedReceiver<()>,
) -> AppResult<()> {
    let mut trial = 0;
    while requests.recv().await.is_some() {
        if stop.is_set() {
            break;
        }
        trial += 1;
        info!(trial, of = protocol.trial_count, "frame-synced trial");
        events.emit(Event::TrialNumber(trial));

        if generator
            .play(protocol.output_channel, &waveform, &stop)
            .await?
            .is_aborted()
        {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{PeriodicTrigger, RecordingOutputs};
    use crate::hardware::PinMap;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn rig(outputs: &RecordingOutputs) -> Rig {
        Rig {
            trigger: Box::new(PeriodicTrigger::new(Duration::from_millis(500))),
            outputs: Arc::new(outputs.clone()),
            pins: PinMap::default(),
        }
    }

    fn short_protocol() -> AppConfig {
        AppConfig {
            protocol: ExperimentProtocol {
                off_frames: 1,
                frames_per_trial: 2,
                trial_count: 1,
                stim_duration_secs: 1,
                stim_frequency_hz: 0,
                wait_for_trigger: false,
                ..ExperimentProtocol::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_each_session_gets_its_own_id() {
        let a = Session::new(AppConfig::default()).unwrap();
        let b = Session::new(AppConfig::default()).unwrap();
        assert_ne!(a.run_id(), b.run_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_parked_before_and_after() {
        let outputs = RecordingOutputs::new();
        let (events, _rx) = EventSink::channel();
        let session = Session::new(short_protocol()).unwrap();

        session
            .run(RunMode::Timed, rig(&outputs), events)
            .await
            .unwrap();

        let pins = PinMap::default();
        for (pin, idle) in [
            (pins.master8, crate::hardware::Level::Low),
            (pins.normal, crate::hardware::Level::Low),
            (pins.inverted, crate::hardware::Level::High),
        ] {
            let writes = outputs.transitions_for(pin);
            assert_eq!(writes.first().map(|t| t.level), Some(idle));
            assert_eq!(writes.last().map(|t| t.level), Some(idle));
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_worker_failure_is_logged_with_run_id() {
        let outputs = RecordingOutputs::new();
        let (events, _rx) = EventSink::channel();
        let session = Session::new(short_protocol()).unwrap();
        let run_id = session.run_id();
        let stop = session.stop_signal();

        let failing = outputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            failing.inject_failure(15);
        });

        let result = session.run(RunMode::Timed, rig(&outputs), events).await;
        assert!(result.is_err());
        assert!(stop.is_set());
        assert!(logs_contain("worker failed, stopping run"));
        assert!(logs_contain(&run_id.to_string()));
    }
}
