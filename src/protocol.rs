//! Experiment protocol, stimulation schedule and run timing policy.
//!
//! An experiment is an off period of `off_frames` frames followed by
//! `trial_count` trials of `frames_per_trial` frames each. Every trial starts
//! with one stimulation window. All of this is fixed before the run starts and
//! validated once; workers only ever read it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppResult, StimError};
use crate::hardware::Level;
use crate::pacing::Pacer;

/// Upper bound on the busy-wait tail of a precise wait.
pub const MAX_SPIN_THRESHOLD: Duration = Duration::from_millis(10);

/// Which stimulation output a protocol drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    /// External Master-8 stimulator: one fixed trigger pulse per trial.
    Master8,
    /// Active-low output (laser driver).
    Inverted,
    /// Active-high output.
    #[default]
    Normal,
}

impl OutputChannel {
    /// Level that turns stimulation on.
    pub fn active_level(self) -> Level {
        match self {
            OutputChannel::Inverted => Level::Low,
            OutputChannel::Master8 | OutputChannel::Normal => Level::High,
        }
    }

    /// Level the line rests at between stimulations.
    pub fn idle_level(self) -> Level {
        match self {
            OutputChannel::Inverted => Level::High,
            OutputChannel::Master8 | OutputChannel::Normal => Level::Low,
        }
    }
}

/// Immutable description of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentProtocol {
    /// Frames (or seconds, when free running) before the first trial.
    pub off_frames: u32,
    /// Length of each trial in frames (or seconds).
    pub frames_per_trial: u32,
    /// Number of trials.
    pub trial_count: u32,
    /// Length of the stimulation window in seconds.
    pub stim_duration_secs: u32,
    /// Pulse rate; 0 means continuous (DC) stimulation.
    pub stim_frequency_hz: u32,
    /// Width of each pulse in milliseconds.
    pub pulse_width_ms: f64,
    /// Output line to drive.
    pub output_channel: OutputChannel,
    /// Hold the timed sequence until the first trigger edge.
    pub wait_for_trigger: bool,
}

impl Default for ExperimentProtocol {
    fn default() -> Self {
        Self {
            off_frames: 10,
            frames_per_trial: 20,
            trial_count: 5,
            stim_duration_secs: 5,
            stim_frequency_hz: 20,
            pulse_width_ms: 10.0,
            output_channel: OutputChannel::Normal,
            wait_for_trigger: true,
        }
    }
}

impl ExperimentProtocol {
    /// Frame index at which a complete run ends.
    pub fn total_frames(&self) -> u64 {
        u64::from(self.off_frames) + u64::from(self.frames_per_trial) * u64::from(self.trial_count)
    }

    /// Seconds the stimulation occupies at the start of each trial.
    ///
    /// The Master-8 trigger pulse plus settle always takes one second, even for
    /// a zero-length stimulation.
    pub fn active_window_secs(&self) -> u32 {
        match self.output_channel {
            OutputChannel::Master8 => self.stim_duration_secs.max(1),
            OutputChannel::Inverted | OutputChannel::Normal => self.stim_duration_secs,
        }
    }

    /// Frames stimulation is scheduled on.
    pub fn schedule(&self) -> StimulationSchedule {
        StimulationSchedule::from_protocol(self)
    }

    /// Reject protocols that cannot be played out as written.
    pub fn validate(&self, timing: &TimingConfig) -> AppResult<()> {
        if self.frames_per_trial == 0 {
            return Err(StimError::Validation(
                "frames_per_trial must be at least 1".into(),
            ));
        }

        if self.active_window_secs() > self.frames_per_trial {
            return Err(StimError::Validation(format!(
                "stimulation window of {}s does not fit in a trial of {} frames",
                self.active_window_secs(),
                self.frames_per_trial
            )));
        }

        // Master-8 ignores frequency and pulse width.
        if self.output_channel == OutputChannel::Master8 {
            return Ok(());
        }

        timing.check_pulse(self.stim_frequency_hz, self.pulse_width_ms)
    }
}

/// Absolute frame indices on which a trial's stimulation starts.
///
/// Entry `i` (1-based) is `off_frames + frames_per_trial * (i - 1) + 1`, so the
/// list is strictly increasing whenever `frames_per_trial >= 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StimulationSchedule {
    frames: Vec<u64>,
}

impl StimulationSchedule {
    /// Compute the schedule for a protocol.
    pub fn from_protocol(protocol: &ExperimentProtocol) -> Self {
        let off = u64::from(protocol.off_frames);
        let per_trial = u64::from(protocol.frames_per_trial);
        let frames = (1..=u64::from(protocol.trial_count))
            .map(|i| off + per_trial * (i - 1) + 1)
            .collect();
        Self { frames }
    }

    /// Whether stimulation starts on `frame`.
    pub fn contains(&self, frame: u64) -> bool {
        self.frames.binary_search(&frame).is_ok()
    }

    /// Scheduled frames in ascending order.
    pub fn frames(&self) -> &[u64] {
        &self.frames
    }

    /// Number of scheduled stimulations.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when no stimulation is scheduled.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Polling, cancellation and pulse-shape timing for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Bounded wait on the trigger line per poll.
    #[serde(with = "humantime_serde")]
    pub edge_timeout: Duration,
    /// Consecutive empty polls after which a started run is considered over.
    pub inactivity_limit: u32,
    /// Granularity of long holds; the stop signal is checked after each one.
    #[serde(with = "humantime_serde")]
    pub hold_increment: Duration,
    /// Width of the Master-8 trigger pulse.
    #[serde(with = "humantime_serde")]
    pub master8_pulse: Duration,
    /// Settle delay after the Master-8 trigger pulse.
    #[serde(with = "humantime_serde")]
    pub master8_settle: Duration,
    /// A pulse train whose off time is within this many ms of zero is played
    /// as one continuous hold.
    pub full_width_tolerance_ms: f64,
    /// Final stretch of every pulse phase and illumination hold that is
    /// busy-waited instead of slept. Zero leaves timing to the 1 ms timer.
    #[serde(with = "humantime_serde")]
    pub spin_threshold: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            edge_timeout: Duration::from_millis(800),
            inactivity_limit: 3,
            hold_increment: Duration::from_secs(1),
            master8_pulse: Duration::from_millis(200),
            master8_settle: Duration::from_millis(800),
            full_width_tolerance_ms: 0.005,
            spin_threshold: Duration::from_millis(2),
        }
    }
}

impl TimingConfig {
    /// Reject timing values that would stall or spin a worker.
    pub fn validate(&self) -> AppResult<()> {
        if self.edge_timeout.is_zero() {
            return Err(StimError::Validation("edge_timeout must be non-zero".into()));
        }
        if self.inactivity_limit == 0 {
            return Err(StimError::Validation(
                "inactivity_limit must be at least 1".into(),
            ));
        }
        if self.hold_increment.is_zero() {
            return Err(StimError::Validation("hold_increment must be non-zero".into()));
        }
        if self.master8_pulse.is_zero() {
            return Err(StimError::Validation("master8_pulse must be non-zero".into()));
        }
        if self.master8_pulse + self.master8_settle > Duration::from_secs(1) {
            return Err(StimError::Validation(format!(
                "master8 pulse plus settle must fit in one second, got {:?}",
                self.master8_pulse + self.master8_settle
            )));
        }
        if !self.full_width_tolerance_ms.is_finite() || self.full_width_tolerance_ms < 0.0 {
            return Err(StimError::Validation(
                "full_width_tolerance_ms must be a non-negative number".into(),
            ));
        }
        if self.spin_threshold > MAX_SPIN_THRESHOLD {
            return Err(StimError::Validation(format!(
                "spin_threshold must be at most {:?}, got {:?}",
                MAX_SPIN_THRESHOLD, self.spin_threshold
            )));
        }
        Ok(())
    }

    /// Precise waiting as configured by `spin_threshold`.
    pub fn pacer(&self) -> Pacer {
        Pacer::new(self.spin_threshold)
    }

    /// Reject a pulse train that cannot be played: a width that is not a
    /// positive number, or one wider than the period beyond the tolerance.
    /// A zero frequency is DC and always accepted.
    pub fn check_pulse(&self, frequency_hz: u32, pulse_width_ms: f64) -> AppResult<()> {
        if frequency_hz == 0 {
            return Ok(());
        }

        if !pulse_width_ms.is_finite() || pulse_width_ms <= 0.0 {
            return Err(StimError::Validation(format!(
                "pulse_width_ms must be a positive number, got {}",
                pulse_width_ms
            )));
        }

        let period_ms = 1000.0 / f64::from(frequency_hz);
        if period_ms - pulse_width_ms < -self.full_width_tolerance_ms {
            return Err(StimError::Validation(format!(
                "pulse width of {} ms exceeds the {:.3} ms period at {} Hz",
                pulse_width_ms, period_ms, frequency_hz
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(off: u32, per_trial: u32, trials: u32) -> ExperimentProtocol {
        ExperimentProtocol {
            off_frames: off,
            frames_per_trial: per_trial,
            trial_count: trials,
            stim_duration_secs: 1,
            ..ExperimentProtocol::default()
        }
    }

    #[test]
    fn test_schedule_shape() {
        for (off, per_trial, trials) in [(0, 1, 1), (2, 3, 2), (10, 20, 5), (7, 4, 0)] {
            let schedule = protocol(off, per_trial, trials).schedule();
            assert_eq!(schedule.len(), trials as usize);
            assert!(schedule.frames().windows(2).all(|w| w[0] < w[1]));
            if let Some(&first) = schedule.frames().first() {
                assert_eq!(first, u64::from(off) + 1);
            }
        }
    }

    #[test]
    fn test_schedule_membership() {
        let schedule = protocol(2, 3, 2).schedule();
        assert_eq!(schedule.frames(), &[3, 6]);
        assert!(schedule.contains(3));
        assert!(!schedule.contains(4));
        assert!(!schedule.contains(9));
    }

    #[test]
    fn test_total_frames() {
        assert_eq!(protocol(2, 3, 2).total_frames(), 8);
    }

    #[test]
    fn test_window_longer_than_trial_rejected() {
        let p = ExperimentProtocol {
            frames_per_trial: 4,
            stim_duration_secs: 5,
            ..ExperimentProtocol::default()
        };
        assert!(matches!(
            p.validate(&TimingConfig::default()),
            Err(StimError::Validation(_))
        ));
    }

    #[test]
    fn test_negative_off_time_rejected() {
        // 50 Hz gives a 20 ms period.
        let p = ExperimentProtocol {
            stim_frequency_hz: 50,
            pulse_width_ms: 25.0,
            ..ExperimentProtocol::default()
        };
        assert!(p.validate(&TimingConfig::default()).is_err());
    }

    #[test]
    fn test_full_width_within_tolerance_accepted() {
        // 4 Hz gives a 250 ms period; the default tolerance is 5 us.
        let p = ExperimentProtocol {
            stim_frequency_hz: 4,
            pulse_width_ms: 250.004,
            ..ExperimentProtocol::default()
        };
        assert!(p.validate(&TimingConfig::default()).is_ok());

        let too_wide = ExperimentProtocol {
            pulse_width_ms: 250.01,
            ..p
        };
        assert!(too_wide.validate(&TimingConfig::default()).is_err());
    }

    #[test]
    fn test_check_pulse_rejects_non_finite_width() {
        let timing = TimingConfig::default();
        assert!(timing.check_pulse(100, f64::NAN).is_err());
        assert!(timing.check_pulse(100, f64::INFINITY).is_err());
        assert!(timing.check_pulse(0, f64::NAN).is_ok());
        assert!(timing.check_pulse(1000, 0.6).is_ok());
    }

    #[test]
    fn test_spin_threshold_bounded() {
        let timing = TimingConfig {
            spin_threshold: Duration::from_millis(50),
            ..TimingConfig::default()
        };
        assert!(timing.validate().is_err());
        assert_eq!(TimingConfig::default().pacer().spin(), Duration::from_millis(2));
    }

    #[test]
    fn test_master8_ignores_pulse_shape() {
        let p = ExperimentProtocol {
            output_channel: OutputChannel::Master8,
            stim_duration_secs: 0,
            frames_per_trial: 1,
            stim_frequency_hz: 100,
            pulse_width_ms: 500.0,
            ..ExperimentProtocol::default()
        };
        assert!(p.validate(&TimingConfig::default()).is_ok());
        assert_eq!(p.active_window_secs(), 1);
    }

    #[test]
    fn test_zero_frames_per_trial_rejected() {
        let p = protocol(0, 0, 1);
        assert!(p.validate(&TimingConfig::default()).is_err());
    }

    #[test]
    fn test_timing_defaults_valid() {
        assert!(TimingConfig::default().validate().is_ok());
        let bad = TimingConfig {
            inactivity_limit: 0,
            ..TimingConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
