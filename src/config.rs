//! Configuration loading using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. `config/default.toml` (or the path given on the command line)
//! 3. environment variables prefixed with `PPG_DAQ_`, with `__` separating
//!    nested keys
//!
//! Durations are humantime strings (`"10ms"`, `"5s"`).
//!
//! # Example
//! ```no_run
//! use ppg_daq::config::Settings;
//!
//! // PPG_DAQ_BUS__DEVICE_PATH=/dev/i2c-1 overrides [bus] device_path
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Sampling {}", settings.bus.device_path.display());
//! # Ok::<(), ppg_daq::error::EngineError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::SchedulerSettings;
use crate::distribution::DistributorConfig;
use crate::error::{EngineError, EngineResult};
use crate::hardware::registers::{DEFAULT_DEVICE_ADDRESS, DEFAULT_MULTIPLEXER_ADDRESS};
use crate::hardware::DeviceFactory;
use crate::logging::LogFormat;
use crate::sinks::RetryPolicy;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "PPG_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Bus device and addresses
    pub bus: BusSettings,
    /// Round loop timing and fault tolerance
    pub acquisition: AcquisitionSettings,
    /// Per-sink queue sizing and alarms
    pub distribution: DistributionSettings,
    /// Network publishing adapters
    pub publish: PublishSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "ppg-daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// i2c-dev character device
    pub device_path: PathBuf,
    /// TCA9548A address
    pub multiplexer_address: u8,
    /// MAX30102 address (same on every channel)
    pub device_address: u8,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/i2c-4"),
            multiplexer_address: DEFAULT_MULTIPLEXER_ADDRESS,
            device_address: DEFAULT_DEVICE_ADDRESS,
        }
    }
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Period between round starts
    #[serde(with = "humantime_serde")]
    pub round_interval: Duration,
    /// Consecutive failures before a channel is degraded
    pub failure_threshold: u32,
    /// Pause after the sensor reset write
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            round_interval: Duration::from_millis(10),
            failure_threshold: 3,
            reset_settle: Duration::from_millis(50),
        }
    }
}

/// Distribution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionSettings {
    /// Rounds buffered per sink
    pub queue_capacity: usize,
    /// Drop rate (percent) that triggers a warning
    pub warn_drop_rate_percent: f64,
    /// Queue occupancy (percent) that triggers an error
    pub error_saturation_percent: f64,
    /// Window for drop rate and saturation alarms
    #[serde(with = "humantime_serde")]
    pub metrics_window: Duration,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        let config = DistributorConfig::default();
        Self {
            queue_capacity: config.capacity,
            warn_drop_rate_percent: config.warn_drop_rate_percent,
            error_saturation_percent: config.error_saturation_percent,
            metrics_window: config.metrics_window,
        }
    }
}

/// Publishing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    /// Topic for published payloads
    pub topic: String,
    /// Rounds per batch payload
    pub batch_rounds: usize,
    /// Nominal sampling frequency reported in batch payloads
    pub frequency_hz: u32,
    /// Retries after a failed publish
    pub max_retries: u32,
    /// Delay between retries
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            topic: "sensor/data".to_string(),
            batch_rounds: 100,
            frequency_hz: 100,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> EngineResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file leaves
    /// the built-in defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        Ok(Self::figment(path.as_ref(), ENV_PREFIX).extract()?)
    }

    fn figment(path: &Path, env_prefix: &str) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |message: String| Err(EngineError::Configuration(message));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.bus.device_path.as_os_str().is_empty() {
            return invalid("bus.device_path must not be empty".to_string());
        }
        for (key, address) in [
            ("multiplexer_address", self.bus.multiplexer_address),
            ("device_address", self.bus.device_address),
        ] {
            if address > 0x7F {
                return invalid(format!("bus.{key} 0x{address:02X} is not a 7-bit address"));
            }
        }
        if self.bus.multiplexer_address == self.bus.device_address {
            return invalid("bus.multiplexer_address and bus.device_address must differ".to_string());
        }

        let interval = self.acquisition.round_interval;
        if interval.is_zero() || interval >= Duration::from_secs(1) {
            return invalid(format!(
                "acquisition.round_interval {interval:?} must be greater than 0 and less than 1s"
            ));
        }
        if self.acquisition.failure_threshold == 0 {
            return invalid("acquisition.failure_threshold must be at least 1".to_string());
        }

        let distribution = &self.distribution;
        if distribution.queue_capacity == 0 {
            return invalid("distribution.queue_capacity must be at least 1".to_string());
        }
        for (key, percent) in [
            ("warn_drop_rate_percent", distribution.warn_drop_rate_percent),
            ("error_saturation_percent", distribution.error_saturation_percent),
        ] {
            if !(0.0..=100.0).contains(&percent) {
                return invalid(format!("distribution.{key} {percent} must be within 0-100"));
            }
        }
        if distribution.metrics_window.is_zero() {
            return invalid("distribution.metrics_window must be greater than 0".to_string());
        }

        if self.publish.topic.is_empty() {
            return invalid("publish.topic must not be empty".to_string());
        }
        if self.publish.batch_rounds == 0 {
            return invalid("publish.batch_rounds must be at least 1".to_string());
        }
        if self.publish.frequency_hz == 0 {
            return invalid("publish.frequency_hz must be at least 1".to_string());
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Round loop settings.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            round_interval: self.acquisition.round_interval,
            failure_threshold: self.acquisition.failure_threshold,
        }
    }

    /// Distributor settings.
    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig::with_thresholds(
            self.distribution.queue_capacity,
            self.distribution.warn_drop_rate_percent,
            self.distribution.error_saturation_percent,
            self.distribution.metrics_window,
        )
    }

    /// Sensor factory for the configured address and settle time.
    pub fn device_factory(&self) -> DeviceFactory {
        DeviceFactory::new(self.bus.device_address).with_reset_settle(self.acquisition.reset_settle)
    }

    /// Retry policy for publishing sinks.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.publish.max_retries,
            backoff: self.publish.retry_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.bus.device_path, PathBuf::from("/dev/i2c-4"));
        assert_eq!(settings.scheduler_settings(), SchedulerSettings::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[bus]
device_path = "/dev/i2c-1"
multiplexer_address = 0x71

[acquisition]
round_interval = "20ms"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.bus.device_path, PathBuf::from("/dev/i2c-1"));
        assert_eq!(settings.bus.multiplexer_address, 0x71);
        assert_eq!(settings.bus.device_address, 0x57);
        assert_eq!(settings.acquisition.round_interval, Duration::from_millis(20));
        assert_eq!(settings.acquisition.failure_threshold, 3);
    }

    #[test]
    fn environment_overrides_nested_keys() {
        std::env::set_var("PPG_DAQ_CFGTEST_ACQUISITION__FAILURE_THRESHOLD", "7");
        let settings: Settings = Settings::figment(Path::new("does-not-exist.toml"), "PPG_DAQ_CFGTEST_")
            .extract()
            .unwrap();
        std::env::remove_var("PPG_DAQ_CFGTEST_ACQUISITION__FAILURE_THRESHOLD");
        assert_eq!(settings.acquisition.failure_threshold, 7);
    }

    #[test]
    fn interval_must_be_below_one_second() {
        let mut settings = Settings::default();
        settings.acquisition.round_interval = Duration::from_secs(1);
        assert!(matches!(settings.validate(), Err(EngineError::Configuration(_))));
        settings.acquisition.round_interval = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn effective_config_renders_as_toml() {
        let rendered = Settings::default().to_toml().unwrap();
        assert!(rendered.contains("round_interval = \"10ms\""));
        assert!(rendered.contains("[publish]"));
    }
}
