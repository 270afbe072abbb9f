//! Frame-synchronised state machine.
//!
//! ```text
//! AwaitingStart --edge--> Running --+--> Completed  (last frame counted)
//!       |                           +--> TimedOut   (trigger went quiet)
//!       +--------stop--------------+--> Aborted    (stop signal)
//! ```
//!
//! The counter owns the trigger line. Every edge after the start edge is one
//! more frame; frames listed in the [`StimulationSchedule`] additionally produce
//! a `StimulateNow` notification right after their `FrameNumber`. The counter
//! never waits for the stimulation itself.

use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::events::{Event, EventSink};
use crate::hardware::{EdgeEvent, EdgeSource};
use crate::protocol::{ExperimentProtocol, StimulationSchedule, TimingConfig};
use crate::stop::StopSignal;

/// Where the counter currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCounterState {
    /// Waiting for the first trigger edge.
    AwaitingStart,
    /// Counting frames.
    Running,
    /// All frames of the protocol were counted.
    Completed,
    /// The stop signal was observed.
    Aborted,
    /// The trigger stayed quiet for `inactivity_limit` polls.
    TimedOut,
}

/// How a frame-counting run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCountOutcome {
    /// Every frame of the protocol was seen.
    Completed,
    /// The trigger stalled; treated as the end of acquisition.
    TimedOut,
    /// Stopped by the user.
    Aborted,
}

/// Mutable counters of a run. Only the frame counter writes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    /// Frames counted so far (the start edge is frame 1).
    pub current_frame: u64,
    /// Consecutive polls without an edge since the last one.
    pub inactive_polls: u32,
    /// Whether the start edge has been seen.
    pub started: bool,
}

/// Counts trigger edges and announces scheduled stimulation frames.
pub struct FrameCounter {
    trigger: Box<dyn EdgeSource>,
    schedule: StimulationSchedule,
    total_frames: u64,
    timing: TimingConfig,
    events: EventSink,
    stop: StopSignal,
    run: RunState,
    state: FrameCounterState,
}

impl FrameCounter {
    /// Build a counter for `protocol`, taking ownership of the trigger line.
    pub fn new(
        trigger: Box<dyn EdgeSource>,
        protocol: &ExperimentProtocol,
        timing: TimingConfig,
        events: EventSink,
        stop: StopSignal,
    ) -> Self {
        Self {
            trigger,
            schedule: protocol.schedule(),
            total_frames: protocol.total_frames(),
            timing,
            events,
            stop,
            run: RunState::default(),
            state: FrameCounterState::AwaitingStart,
        }
    }

    /// Current state machine position.
    pub fn state(&self) -> FrameCounterState {
        self.state
    }

    /// Snapshot of the run counters.
    pub fn run_state(&self) -> RunState {
        self.run
    }

    /// Drive the state machine until a terminal state.
    ///
    /// Exactly one terminal notification is emitted: `ForceStopped` on abort,
    /// `Finished` otherwise. A trigger read error ends the run without one.
    pub async fn run(&mut self) -> AppResult<FrameCountOutcome> {
        info!(
            total_frames = self.total_frames,
            stimulations = self.schedule.len(),
            "waiting for first trigger edge"
        );

        loop {
            match self.state {
                FrameCounterState::AwaitingStart => {
                    if let Some(outcome) = self.await_start().await? {
                        return Ok(outcome);
                    }
                }
                FrameCounterState::Running => {
                    if let Some(outcome) = self.step().await? {
                        return Ok(outcome);
                    }
                }
                FrameCounterState::Completed => return Ok(FrameCountOutcome::Completed),
                FrameCounterState::TimedOut => return Ok(FrameCountOutcome::TimedOut),
                FrameCounterState::Aborted => return Ok(FrameCountOutcome::Aborted),
            }
        }
    }

    async fn await_start(&mut self) -> AppResult<Option<FrameCountOutcome>> {
        match self
            .trigger
            .wait_for_rising_edge(self.timing.edge_timeout)
            .await?
        {
            EdgeEvent::Detected => {
                self.run.started = true;
                self.run.current_frame = 1;
                self.state = FrameCounterState::Running;
                info!("experiment started");
                self.events.emit(Event::ExperimentStarted);
                self.announce_frame();

                if self.run.current_frame >= self.total_frames {
                    return Ok(Some(self.finish(FrameCounterState::Completed)));
                }
                Ok(None)
            }
            EdgeEvent::Timeout => {
                if self.stop.is_set() {
                    return Ok(Some(self.finish(FrameCounterState::Aborted)));
                }
                Ok(None)
            }
        }
    }

    async fn step(&mut self) -> AppResult<Option<FrameCountOutcome>> {
        match self
            .trigger
            .wait_for_rising_edge(self.timing.edge_timeout)
            .await?
        {
            EdgeEvent::Detected => {
                self.run.current_frame += 1;
                self.run.inactive_polls = 0;
                self.announce_frame();
            }
            EdgeEvent::Timeout => {
                self.run.inactive_polls += 1;
                debug!(
                    inactive_polls = self.run.inactive_polls,
                    frame = self.run.current_frame,
                    "no trigger edge"
                );
            }
        }

        if self.stop.is_set() {
            return Ok(Some(self.finish(FrameCounterState::Aborted)));
        }
        if self.run.current_frame >= self.total_frames {
            return Ok(Some(self.finish(FrameCounterState::Completed)));
        }
        if self.run.inactive_polls >= self.timing.inactivity_limit {
            return Ok(Some(self.finish(FrameCounterState::TimedOut)));
        }
        Ok(None)
    }

    fn announce_frame(&self) {
        let frame = self.run.current_frame;
        debug!(frame, "frame");
        self.events.emit(Event::FrameNumber(frame));
        if self.schedule.contains(frame) {
            info!(frame, "stimulate now");
            self.events.emit(Event::StimulateNow);
        }
    }

    fn finish(&mut self, state: FrameCounterState) -> FrameCountOutcome {
        self.state = state;
        match state {
            FrameCounterState::Aborted => {
                warn!(frame = self.run.current_frame, "force stopped");
                self.events.emit(Event::ForceStopped);
                FrameCountOutcome::Aborted
            }
            FrameCounterState::TimedOut => {
                warn!(
                    frame = self.run.current_frame,
                    "trigger inactive, treating as end of acquisition"
                );
                self.events.emit(Event::Finished);
                FrameCountOutcome::TimedOut
            }
            _ => {
                info!(frame = self.run.current_frame, "all frames counted");
                self.events.emit(Event::Finished);
                FrameCountOutcome::Completed
            }
        }
    }
}
