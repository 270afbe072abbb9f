//! Command line front end for the stimulation controller.
//!
//! ```bash
//! # Frame-synchronised run against a simulated 1 Hz trigger, 120 frames
//! stim_sync run --mode frame-sync --frame-period 1s --frames 120
//!
//! # Timed run that aborts itself after ten seconds
//! stim_sync run --mode timed --abort-after 10s
//!
//! # Show the effective configuration
//! stim_sync config
//! ```
//!
//! Events are written to stdout as JSON lines; logs go to stderr.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use stim_sync::config::AppConfig;
use stim_sync::events::{Event, EventSink};
use stim_sync::hardware::mock::{PeriodicTrigger, RecordingOutputs};
use stim_sync::hardware::Rig;
use stim_sync::logging;
use stim_sync::session::{RunMode, RunOutcome, Session};

#[derive(Parser, Debug)]
#[command(name = "stim_sync")]
#[command(author, version, about = "Frame-synchronised stimulation controller", long_about = None)]
struct Cli {
    /// Configuration file (defaults to <config dir>/stim_sync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an experiment on the simulated rig
    Run(RunArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Timing loop that drives the run
    #[arg(short, long, value_enum, default_value = "frame-sync")]
    mode: ModeArg,

    /// Interval between simulated trigger edges
    #[arg(
        long,
        default_value = "1s",
        value_parser = humantime_serde::re::humantime::parse_duration
    )]
    frame_period: Duration,

    /// Stop the simulated trigger after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Raise the stop signal after this long
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    abort_after: Option<Duration>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    FrameSync,
    Timed,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::FrameSync => RunMode::FrameSync,
            ModeArg::Timed => RunMode::Timed,
        }
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a Event,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Run(args) => run(config, args).await,
    }
}

async fn run(config: AppConfig, args: RunArgs) -> Result<()> {
    logging::init(&config.logging)?;

    let pins = config.pins.clone();
    let session = Session::new(config).context("Invalid configuration")?;
    let stop = session.stop_signal();

    let mut trigger = PeriodicTrigger::new(args.frame_period);
    if let Some(frames) = args.frames {
        trigger = trigger.with_frame_limit(frames);
    }
    let outputs = RecordingOutputs::new();
    let rig = Rig {
        trigger: Box::new(trigger),
        outputs: Arc::new(outputs.clone()),
        pins,
    };

    let (events, mut rx) = EventSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = EventLine {
                timestamp: Utc::now(),
                event: &event,
            };
            match serde_json::to_string(&line) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, ?event, "failed to encode event"),
            }
        }
    });

    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping run");
            interrupt.trigger();
        }
    });

    if let Some(after) = args.abort_after {
        let deadline = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            info!(?after, "abort timer elapsed");
            deadline.trigger();
        });
    }

    info!(run_id = %session.run_id(), mode = ?args.mode, "starting run");
    let outcome = session.run(args.mode.into(), rig, events).await?;
    printer.await.context("Event printer failed")?;

    info!(
        ?outcome,
        transitions = outputs.transitions().len(),
        "run complete"
    );
    if outcome == RunOutcome::TimedOut {
        warn!("trigger stopped before the last frame");
    }
    Ok(())
}
