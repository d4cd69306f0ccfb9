//! The shipped configuration file and file-based overrides.

use std::io::Write;
use std::time::Duration;

use ppg_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use ppg_daq::logging::LogFormat;
use ppg_daq::EngineError;

#[test]
fn test_shipped_config_matches_defaults() {
    let settings = Settings::load_from(DEFAULT_CONFIG_PATH).unwrap();
    assert_eq!(settings, Settings::default());
    settings.validate().unwrap();
}

#[test]
fn test_partial_file_keeps_remaining_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[application]
log_format = "json"

[bus]
device_path = "/dev/i2c-1"

[distribution]
queue_capacity = 16
"#
    )
    .unwrap();

    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.application.log_format, LogFormat::Json);
    assert_eq!(settings.bus.device_path.to_str(), Some("/dev/i2c-1"));
    assert_eq!(settings.bus.multiplexer_address, 0x70);
    assert_eq!(settings.distributor_config().capacity, 16);
    assert_eq!(settings.acquisition.round_interval, Duration::from_millis(10));
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
fn test_out_of_range_interval_is_rejected() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[acquisition]\nround_interval = \"2s\"").unwrap();

    let settings = Settings::load_from(file.path()).unwrap();
    assert!(matches!(
        settings.validate(),
        Err(EngineError::Configuration(_))
    ));
}

#[test]
fn test_rendered_config_loads_back() {
    let mut settings = Settings::default();
    settings.publish.topic = "ward-3/ppg".to_string();
    settings.acquisition.failure_threshold = 5;

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(settings.to_toml().unwrap().as_bytes()).unwrap();

    assert_eq!(Settings::load_from(file.path()).unwrap(), settings);
}
