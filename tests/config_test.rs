//! Layered configuration loading: defaults, TOML file and environment.

use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use stim_sync::config::AppConfig;
use stim_sync::error::StimError;
use stim_sync::protocol::OutputChannel;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const RIG_TOML: &str = r#"
[protocol]
off_frames = 30
frames_per_trial = 40
trial_count = 3
stim_duration_secs = 2
stim_frequency_hz = 0
output_channel = "master8"

[timing]
edge_timeout = "1s"
hold_increment = "100ms"

[pins]
leds = [21, 23]

[[leds.channels]]
enabled = true
period_us = 5000

[[leds.channels]]
enabled = false
period_us = 1000

[logging]
level = "debug"
json = true
"#;

#[test]
#[serial]
fn test_load_from_file() {
    let file = config_file(RIG_TOML);
    let config = AppConfig::load(Some(file.path())).unwrap();

    assert_eq!(config.protocol.off_frames, 30);
    assert_eq!(config.protocol.total_frames(), 30 + 40 * 3);
    assert_eq!(config.protocol.output_channel, OutputChannel::Master8);
    assert_eq!(config.timing.edge_timeout, Duration::from_secs(1));
    assert_eq!(config.timing.hold_increment, Duration::from_millis(100));
    assert_eq!(config.timing.inactivity_limit, 3);
    assert_eq!(config.pins.leds, vec![21, 23]);
    assert_eq!(config.pins.normal, 15);
    assert_eq!(config.leds.channels.len(), 2);
    assert!(config.logging.json);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = config_file(RIG_TOML);
    std::env::set_var("STIM_SYNC_PROTOCOL__TRIAL_COUNT", "7");
    std::env::set_var("STIM_SYNC_TIMING__EDGE_TIMEOUT", "250ms");
    let result = AppConfig::load(Some(file.path()));
    std::env::remove_var("STIM_SYNC_PROTOCOL__TRIAL_COUNT");
    std::env::remove_var("STIM_SYNC_TIMING__EDGE_TIMEOUT");

    let config = result.unwrap();
    assert_eq!(config.protocol.trial_count, 7);
    assert_eq!(config.protocol.off_frames, 30);
    assert_eq!(config.timing.edge_timeout, Duration::from_millis(250));
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(matches!(
        AppConfig::load(Some(&path)),
        Err(StimError::MissingConfig(p)) if p == path
    ));
}

#[test]
#[serial]
fn test_too_many_led_channels_for_pins_rejected() {
    let file = config_file(
        r#"
        [pins]
        leds = [21]

        [[leds.channels]]
        enabled = true
        period_us = 1000

        [[leds.channels]]
        enabled = true
        period_us = 1000
        "#,
    );
    assert!(matches!(
        AppConfig::load(Some(file.path())),
        Err(StimError::Validation(_))
    ));
}

#[test]
#[serial]
fn test_pulse_wider_than_period_rejected() {
    let file = config_file(
        r#"
        [protocol]
        stim_frequency_hz = 50
        pulse_width_ms = 25.0
        output_channel = "normal"
        "#,
    );
    assert!(matches!(
        AppConfig::load(Some(file.path())),
        Err(StimError::Validation(_))
    ));
}
