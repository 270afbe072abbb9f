//! Wall-clock trial sequences driven through a session.

mod common;

use std::time::Duration;

use common::{count, drain, simulated_rig, trial_numbers};
use stim_sync::config::AppConfig;
use stim_sync::events::{Event, EventSink};
use stim_sync::hardware::mock::{PeriodicTrigger, ScriptedTrigger};
use stim_sync::hardware::Level;
use stim_sync::protocol::{ExperimentProtocol, OutputChannel, TimingConfig};
use stim_sync::session::{RunMode, RunOutcome, Session};
use tokio::time::{sleep, Instant};

/// Timer-only pacing: the clock is paused in these tests.
fn config(protocol: ExperimentProtocol) -> AppConfig {
    AppConfig {
        protocol,
        timing: TimingConfig {
            spin_threshold: Duration::ZERO,
            ..TimingConfig::default()
        },
        ..AppConfig::default()
    }
}

/// One off second, then two three-second trials with a one-second stimulation.
fn protocol(
    channel: OutputChannel,
    frequency_hz: u32,
    wait_for_trigger: bool,
) -> ExperimentProtocol {
    ExperimentProtocol {
        off_frames: 1,
        frames_per_trial: 3,
        trial_count: 2,
        stim_duration_secs: 1,
        stim_frequency_hz: frequency_hz,
        pulse_width_ms: 20.0,
        output_channel: channel,
        wait_for_trigger,
    }
}

#[tokio::test(start_paused = true)]
async fn test_free_running_dc_sequence() {
    let start = Instant::now();
    let (trigger, _handle) = ScriptedTrigger::new();
    let (rig, outputs) = simulated_rig(trigger);
    let (events, mut rx) = EventSink::channel();
    let session = Session::new(config(protocol(OutputChannel::Normal, 0, false))).unwrap();

    let outcome = session.run(RunMode::Timed, rig, events).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(start.elapsed(), Duration::from_secs(7));

    let on: Vec<(Duration, Duration)> = outputs
        .active_intervals(15, Level::High)
        .iter()
        .map(|(a, b)| (*a - start, *b - start))
        .collect();
    assert_eq!(
        on,
        vec![
            (Duration::from_secs(1), Duration::from_secs(2)),
            (Duration::from_secs(4), Duration::from_secs(5)),
        ]
    );

    let events = drain(&mut rx);
    assert_eq!(events.first(), Some(&Event::ExperimentStarted));
    assert_eq!(events.last(), Some(&Event::Finished));
    assert_eq!(trial_numbers(&events), vec![1, 2]);
    assert_eq!(count(&events, Event::StimOff), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pulse_train_on_inverted_channel() {
    let (trigger, _handle) = ScriptedTrigger::new();
    let (rig, outputs) = simulated_rig(trigger);
    let (events, _rx) = EventSink::channel();
    let session = Session::new(config(protocol(OutputChannel::Inverted, 10, false))).unwrap();

    session.run(RunMode::Timed, rig, events).await.unwrap();

    // Inverted polarity: active low, parked high.
    let pulses = outputs.active_intervals(13, Level::Low);
    assert_eq!(pulses.len(), 20);
    for (on, off) in &pulses {
        assert_eq!(*off - *on, Duration::from_millis(20));
    }
    assert_eq!(
        outputs.transitions_for(13).last().map(|t| t.level),
        Some(Level::High)
    );
    assert!(outputs.active_intervals(15, Level::High).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_master8_trigger_pulses() {
    let start = Instant::now();
    let (trigger, _handle) = ScriptedTrigger::new();
    let (rig, outputs) = simulated_rig(trigger);
    let (events, _rx) = EventSink::channel();
    let session = Session::new(config(protocol(OutputChannel::Master8, 20, false))).unwrap();

    session.run(RunMode::Timed, rig, events).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(7));

    let pulses = outputs.active_intervals(19, Level::High);
    assert_eq!(pulses.len(), 2);
    for (on, off) in &pulses {
        assert_eq!(*off - *on, Duration::from_millis(200));
    }
    assert_eq!(pulses[1].0 - pulses[0].0, Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_sequence_held_until_first_trigger_edge() {
    let start = Instant::now();
    let trigger = PeriodicTrigger::new(Duration::from_millis(2500)).with_frame_limit(1);
    let (rig, outputs) = simulated_rig(trigger);
    let (events, mut rx) = EventSink::channel();
    let session = Session::new(config(protocol(OutputChannel::Normal, 0, true))).unwrap();

    let outcome = session.run(RunMode::Timed, rig, events).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let first = outputs.active_intervals(15, Level::High)[0].0;
    assert_eq!(first - start, Duration::from_millis(3500));
    assert_eq!(drain(&mut rx).first(), Some(&Event::ExperimentStarted));
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_waiting_for_trigger() {
    let (trigger, _handle) = ScriptedTrigger::new();
    let (rig, outputs) = simulated_rig(trigger);
    let (events, mut rx) = EventSink::channel();
    let session = Session::new(config(protocol(OutputChannel::Normal, 0, true))).unwrap();
    let stop = session.stop_signal();

    tokio::spawn(async move {
        sleep(Duration::from_secs(3)).await;
        stop.trigger();
    });

    let outcome = session.run(RunMode::Timed, rig, events).await.unwrap();
    assert_eq!(outcome, RunOutcome::Aborted);
    assert_eq!(drain(&mut rx), vec![Event::ForceStopped]);
    assert!(outputs.active_intervals(15, Level::High).is_empty());
}
