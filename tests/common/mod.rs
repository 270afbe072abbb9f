//! Common test utilities for stim_sync integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions with appropriate tolerances
//! - Building simulated rigs
//! - Collecting emitted events

#![allow(dead_code)] // Utilities may not all be used by every test binary

use std::sync::Arc;
use std::time::Duration;

use stim_sync::events::Event;
use stim_sync::hardware::mock::RecordingOutputs;
use stim_sync::hardware::{EdgeSource, PinMap, Rig};
use tokio::sync::mpsc::UnboundedReceiver;

/// Tolerance levels for timing assertions.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - only for simulated time with `start_paused = true`
    Exact,
    /// 5% tolerance
    Tight,
    /// 20% tolerance
    Normal,
}

impl TimingTolerance {
    /// Get the tolerance factor as a fraction (0.0 to 1.0)
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Tight => 0.05,
            TimingTolerance::Normal => 0.20,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
///
/// # Panics
/// Panics if the actual duration is outside the tolerance range.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:.0}%, got {:?} (acceptable range: {:?} to {:?})",
        context,
        expected,
        factor * 100.0,
        actual,
        min,
        max
    );
}

/// A rig on the default pin map with a recording output driver.
///
/// The returned recorder shares its log with the one inside the rig.
pub fn simulated_rig(trigger: impl EdgeSource + 'static) -> (Rig, RecordingOutputs) {
    let outputs = RecordingOutputs::new();
    let rig = Rig {
        trigger: Box::new(trigger),
        outputs: Arc::new(outputs.clone()),
        pins: PinMap::default(),
    };
    (rig, outputs)
}

/// Everything already sent on `rx`.
pub fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Trial numbers in emission order.
pub fn trial_numbers(events: &[Event]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::TrialNumber(n) => Some(*n),
            _ => None,
        })
        .collect()
}

/// Number of occurrences of `event`.
pub fn count(events: &[Event], event: Event) -> usize {
    events.iter().filter(|e| **e == event).count()
}
