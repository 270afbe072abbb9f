//! Frame-synchronised stimulation controller.
//!
//! This library drives electrical stimulation and illumination outputs in lock
//! step with an imaging system's frame trigger. It counts rising edges on a
//! trigger line, decides which frames start a stimulation trial, plays the
//! stimulation waveform (continuous hold, pulse train or MASTER8 external
//! trigger) on one of three output channels, and rotates through up to four
//! illumination channels, one per frame. A wall-clock timed trial sequence is
//! available for rigs without a frame trigger.
//!
//! Every timing loop runs on its own Tokio task and observes one shared
//! [`stop::StopSignal`]; progress is reported as [`events::Event`]s.
//! Hardware is reached only through the traits in [`hardware::capabilities`].

pub mod config;
pub mod error;
pub mod events;
pub mod frame_counter;
pub mod hardware;
pub mod led;
pub mod logging;
pub mod pacing;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod stop;
pub mod waveform;
