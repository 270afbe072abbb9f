//! Cooperative cancellation shared by every timing loop.
//!
//! A [`StopSignal`] is cloned into each worker. The abort action is the only
//! writer; once set it stays set for the rest of the run. Workers never get
//! preempted: they poll the flag at every edge-wait timeout and after every
//! sleep increment, so a stop request is honoured within one polling interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

/// Shared, thread-safe abort flag.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    /// Create a fresh, unset signal for a new run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that every worker observing this signal winds down.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether an abort has been requested.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Result of a cancellable timed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran to its natural end.
    Completed,
    /// The stop signal was observed at a checkpoint.
    Aborted,
}

impl Outcome {
    /// True if the operation was cut short by the stop signal.
    pub fn is_aborted(self) -> bool {
        self == Outcome::Aborted
    }
}

/// Sleep for `total`, split into `increment`-sized steps, checking `stop`
/// after each step.
///
/// The final step is shortened so the total is exact. A zero `total` returns
/// immediately without looking at the signal.
pub async fn hold(total: Duration, increment: Duration, stop: &StopSignal) -> Outcome {
    // A zero increment would never make progress.
    let increment = increment.max(Duration::from_millis(1));
    let mut remaining = total;

    while !remaining.is_zero() {
        let step = remaining.min(increment);
        sleep(step).await;
        remaining -= step;

        if stop.is_set() {
            return Outcome::Aborted;
        }
    }

    Outcome::Completed
}
