//! Notifications emitted by the timing workers.
//!
//! Workers never wait on the consumer: every notification is pushed into an
//! unbounded queue and a closed queue is silently ignored. The front-end (or the
//! CLI) drains the receiving half at its own pace.

use serde::Serialize;
use tokio::sync::mpsc;

/// A single notification from a worker to the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum Event {
    /// The first trigger edge arrived (or a free-running sequence began).
    ExperimentStarted,
    /// A worker observed the stop signal and exited early.
    ForceStopped,
    /// The stimulation output is about to change level.
    StimOn,
    /// The active stimulation window has ended.
    StimOff,
    /// A new trial began (1-based).
    TrialNumber(u32),
    /// A trigger edge was counted as this frame (1-based).
    FrameNumber(u64),
    /// The current frame is scheduled to start a stimulation.
    StimulateNow,
    /// The run reached its natural end (or the trigger went quiet).
    Finished,
}

impl Event {
    /// Whether this notification ends a worker's run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Event::ForceStopped | Event::Finished)
    }
}

/// Fire-and-forget sender handed to every worker.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Create a sink together with the receiving end for the consumer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a notification. Never blocks; a missing consumer is not an error.
    pub fn emit(&self, event: Event) {
        tracing::trace!(?event, "emit");
        let _ = self.tx.send(event);
    }
}
