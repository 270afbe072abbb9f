//! Mock Hardware Implementations
//!
//! Provides simulated rig devices for testing and dry runs without a board.
//! All mock devices use async-safe timing (`tokio::time`, not `std::thread::sleep`),
//! so they run deterministically under a paused Tokio clock.
//!
//! # Available Mocks
//!
//! - `PeriodicTrigger` - trigger line with a fixed frame period and optional frame limit
//! - `ScriptedTrigger` - trigger line whose edges are fired by a [`TriggerHandle`]
//! - `RecordingOutputs` - output driver that timestamps every level change

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};

use crate::error::{AppResult, StimError};
use crate::hardware::capabilities::{EdgeEvent, EdgeSource, Level, OutputPins};

// =============================================================================
// PeriodicTrigger - Simulated imaging trigger
// =============================================================================

/// Trigger line producing one rising edge every `period`.
///
/// After `frame_limit` edges (if set) the line goes quiet, which is how an
/// imaging system looks once acquisition has stopped.
///
/// # Example
///
/// ```rust,ignore
/// let mut trigger = PeriodicTrigger::new(Duration::from_millis(100)).with_frame_limit(5);
/// let edge = trigger.wait_for_rising_edge(Duration::from_millis(800)).await?;
/// assert_eq!(edge, EdgeEvent::Detected);
/// ```
#[derive(Debug)]
pub struct PeriodicTrigger {
    period: Duration,
    next_edge: Instant,
    remaining: Option<u64>,
}

impl PeriodicTrigger {
    /// First edge arrives one `period` after construction.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_edge: Instant::now() + period,
            remaining: None,
        }
    }

    /// Stop producing edges after `frames` edges.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.remaining = Some(frames);
        self
    }

    /// Delay the first edge by `delay` (measured from now).
    pub fn starting_after(mut self, delay: Duration) -> Self {
        self.next_edge = Instant::now() + delay;
        self
    }

    /// Number of edges still to come, if limited.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }
}

#[async_trait]
impl EdgeSource for PeriodicTrigger {
    async fn wait_for_rising_edge(&mut self, wait: Duration) -> AppResult<EdgeEvent> {
        if self.remaining == Some(0) {
            sleep(wait).await;
            return Ok(EdgeEvent::Timeout);
        }

        let deadline = Instant::now() + wait;
        if self.next_edge > deadline {
            sleep_until(deadline).await;
            return Ok(EdgeEvent::Timeout);
        }

        sleep_until(self.next_edge).await;
        self.next_edge += self.period;
        if let Some(left) = self.remaining.as_mut() {
            *left -= 1;
        }
        Ok(EdgeEvent::Detected)
    }
}

// =============================================================================
// ScriptedTrigger - Edges on demand
// =============================================================================

/// Trigger line whose edges are fired explicitly through a [`TriggerHandle`].
#[derive(Debug)]
pub struct ScriptedTrigger {
    edges: mpsc::UnboundedReceiver<()>,
}

/// Sending half of a [`ScriptedTrigger`].
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ScriptedTrigger {
    /// Create a trigger line and the handle that fires it.
    pub fn new() -> (Self, TriggerHandle) {
        let (tx, edges) = mpsc::unbounded_channel();
        (Self { edges }, TriggerHandle { tx })
    }
}

impl TriggerHandle {
    /// Queue one rising edge.
    pub fn fire(&self) {
        let _ = self.tx.send(());
    }

    /// Queue `count` rising edges back to back.
    pub fn fire_many(&self, count: usize) {
        for _ in 0..count {
            self.fire();
        }
    }
}

#[async_trait]
impl EdgeSource for ScriptedTrigger {
    async fn wait_for_rising_edge(&mut self, wait: Duration) -> AppResult<EdgeEvent> {
        let deadline = Instant::now() + wait;
        match timeout(wait, self.edges.recv()).await {
            Ok(Some(())) => Ok(EdgeEvent::Detected),
            // Handle dropped: the line is dead, behave like a silent input.
            Ok(None) => {
                sleep_until(deadline).await;
                Ok(EdgeEvent::Timeout)
            }
            Err(_) => Ok(EdgeEvent::Timeout),
        }
    }
}

// =============================================================================
// RecordingOutputs - Output driver with a transition log
// =============================================================================

/// One recorded level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Tokio clock time of the write.
    pub at: Instant,
    /// Pin that was written.
    pub pin: u8,
    /// Level written.
    pub level: Level,
}

/// Output driver that records every write for later inspection.
///
/// Clones share the same log, so a test can keep one handle while the rig
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingOutputs {
    log: Arc<Mutex<Vec<Transition>>>,
    fail_armed: Arc<AtomicBool>,
    fail_once: Arc<AtomicBool>,
    fail_pin: Arc<AtomicU8>,
}

impl RecordingOutputs {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write to `pin` fail.
    pub fn inject_failure(&self, pin: u8) {
        self.fail_once.store(false, Ordering::SeqCst);
        self.arm(pin);
    }

    /// Make only the next write to `pin` fail.
    pub fn fail_once(&self, pin: u8) {
        self.fail_once.store(true, Ordering::SeqCst);
        self.arm(pin);
    }

    fn arm(&self, pin: u8) {
        self.fail_pin.store(pin, Ordering::SeqCst);
        self.fail_armed.store(true, Ordering::SeqCst);
    }

    /// All recorded writes in order.
    pub fn transitions(&self) -> Vec<Transition> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Recorded writes for a single pin.
    pub fn transitions_for(&self, pin: u8) -> Vec<Transition> {
        self.transitions()
            .into_iter()
            .filter(|t| t.pin == pin)
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Intervals during which `pin` sat at `active`, as (start, end) pairs.
    ///
    /// Repeated writes of the same level are collapsed. An interval still open
    /// at the end of the log is not reported.
    pub fn active_intervals(&self, pin: u8, active: Level) -> Vec<(Instant, Instant)> {
        let mut intervals = Vec::new();
        let mut opened: Option<Instant> = None;
        for t in self.transitions_for(pin) {
            match (opened, t.level == active) {
                (None, true) => opened = Some(t.at),
                (Some(start), false) => {
                    intervals.push((start, t.at));
                    opened = None;
                }
                _ => {}
            }
        }
        intervals
    }
}

impl OutputPins for RecordingOutputs {
    fn set_level(&self, pin: u8, level: Level) -> AppResult<()> {
        if self.fail_armed.load(Ordering::SeqCst) && self.fail_pin.load(Ordering::SeqCst) == pin {
            if self.fail_once.load(Ordering::SeqCst) {
                self.fail_armed.store(false, Ordering::SeqCst);
            }
            return Err(StimError::Hardware(format!(
                "injected write failure on pin {}",
                pin
            )));
        }
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Transition {
                at: Instant::now(),
                pin,
                level,
            });
        Ok(())
    }
}
