//! Per-instrument configuration.
//!
//! Each driver is built from its own config struct. The recognized options are
//! the port settings shared by every instrument (`port_path`, `baud_rate`,
//! `read_timeout_ms`, `retry_count`, `poll_interval_ms`) plus a few device
//! calibration values. Unknown keys are an error, never silently ignored.
//!
//! A whole lab can be described in one TOML file and loaded with
//! [`LabConfig::load`]. Environment variables prefixed with `QOLAB_` override
//! the file, with `__` separating sections:
//!
//! ```toml
//! [delay_stage]
//! port_path = "/dev/ttyUSB0"
//! retry_count = 8
//!
//! [coincidence_counter]
//! port_path = "/dev/ttyUSB1"
//!
//! [temperature_controller]
//! port_path = "/dev/ttyUSB2"
//! stable_samples = 5
//! ```
//!
//! `QOLAB_DELAY_STAGE__RETRY_COUNT=3` would then replace the stage's retry
//! count.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coincidence_counter::{COINCIDENCE_WINDOW_RANGE_NS, INTEGRATION_WINDOW_RANGE_MS};
use crate::transport::SerialSettings;

pub const ENV_PREFIX: &str = "QOLAB_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("Failed to load configuration: {0}")]
    Load(Box<figment::Error>),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn extract<T: DeserializeOwned>(figment: &Figment) -> Result<T, ConfigError> {
    Ok(figment.extract()?)
}

fn validate_port(
    port_path: &str,
    baud_rate: u32,
    read_timeout_ms: u64,
    retry_count: u32,
) -> Result<(), ConfigError> {
    if port_path.trim().is_empty() {
        return Err(invalid("port_path", "must not be empty"));
    }
    if baud_rate == 0 {
        return Err(invalid("baud_rate", "must be positive"));
    }
    if read_timeout_ms == 0 {
        return Err(invalid("read_timeout_ms", "must be positive"));
    }
    if retry_count == 0 {
        return Err(invalid("retry_count", "must allow at least one attempt"));
    }
    Ok(())
}

fn validate_range(field: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    if !min.is_finite() || !max.is_finite() || min >= max {
        return Err(invalid(field, format!("[{min}, {max}] is not a valid range")));
    }
    Ok(())
}

// Default value functions
fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_stage_baud_rate() -> u32 {
    9600
}

fn default_stage_retry_count() -> u32 {
    5
}

fn default_stage_poll_interval_ms() -> u64 {
    100
}

fn default_min_position_mm() -> f64 {
    1.0
}

fn default_max_position_mm() -> f64 {
    29.0
}

fn default_position_tolerance_mm() -> f64 {
    0.01
}

fn default_motion_timeout_ms() -> u64 {
    30_000
}

fn default_counter_baud_rate() -> u32 {
    19200
}

fn default_counter_retry_count() -> u32 {
    3
}

fn default_counter_poll_interval_ms() -> u64 {
    50
}

fn default_integration_window_ms() -> u32 {
    1000
}

fn default_coincidence_window_ns() -> u32 {
    3
}

fn default_temperature_baud_rate() -> u32 {
    115_200
}

fn default_temperature_retry_count() -> u32 {
    5
}

fn default_temperature_poll_interval_ms() -> u64 {
    1000
}

fn default_min_setpoint_c() -> f64 {
    10.0
}

fn default_max_setpoint_c() -> f64 {
    50.0
}

fn default_stable_samples() -> u32 {
    3
}

fn default_stability_tolerance_c() -> f64 {
    0.1
}

/// Motorized delay stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayStageConfig {
    pub port_path: String,
    #[serde(default = "default_stage_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Timed-out reads tolerated during one `home`/`move_to`.
    #[serde(default = "default_stage_retry_count")]
    pub retry_count: u32,
    /// Pause between motion-status polls.
    #[serde(default = "default_stage_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_min_position_mm")]
    pub min_position_mm: f64,
    #[serde(default = "default_max_position_mm")]
    pub max_position_mm: f64,
    /// How far the confirmed position may be from the target.
    #[serde(default = "default_position_tolerance_mm")]
    pub position_tolerance_mm: f64,
    /// Upper bound on one motion, however often the stage answers "moving".
    #[serde(default = "default_motion_timeout_ms")]
    pub motion_timeout_ms: u64,
}

impl DelayStageConfig {
    pub fn new(port_path: impl Into<String>) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate: default_stage_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            retry_count: default_stage_retry_count(),
            poll_interval_ms: default_stage_poll_interval_ms(),
            min_position_mm: default_min_position_mm(),
            max_position_mm: default_max_position_mm(),
            position_tolerance_mm: default_position_tolerance_mm(),
            motion_timeout_ms: default_motion_timeout_ms(),
        }
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = extract(&Figment::from(Toml::string(toml)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_port(
            &self.port_path,
            self.baud_rate,
            self.read_timeout_ms,
            self.retry_count,
        )?;
        validate_range("position_mm", self.min_position_mm, self.max_position_mm)?;
        if !(self.position_tolerance_mm.is_finite() && self.position_tolerance_mm > 0.0) {
            return Err(invalid("position_tolerance_mm", "must be positive"));
        }
        if self.motion_timeout_ms == 0 {
            return Err(invalid("motion_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.port_path, self.baud_rate, self.read_timeout())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }
}

/// CC1 coincidence counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoincidenceCounterConfig {
    pub port_path: String,
    #[serde(default = "default_counter_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Attempts per `read_counts` when the counter does not answer.
    #[serde(default = "default_counter_retry_count")]
    pub retry_count: u32,
    /// Backoff between those attempts.
    #[serde(default = "default_counter_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// What the counter is assumed to be set to until `configure` runs.
    #[serde(default = "default_integration_window_ms")]
    pub integration_window_ms: u32,
    #[serde(default = "default_coincidence_window_ns")]
    pub coincidence_window_ns: u32,
}

impl CoincidenceCounterConfig {
    pub fn new(port_path: impl Into<String>) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate: default_counter_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            retry_count: default_counter_retry_count(),
            poll_interval_ms: default_counter_poll_interval_ms(),
            integration_window_ms: default_integration_window_ms(),
            coincidence_window_ns: default_coincidence_window_ns(),
        }
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = extract(&Figment::from(Toml::string(toml)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_port(
            &self.port_path,
            self.baud_rate,
            self.read_timeout_ms,
            self.retry_count,
        )?;
        if !INTEGRATION_WINDOW_RANGE_MS.contains(&self.integration_window_ms) {
            return Err(invalid(
                "integration_window_ms",
                format!("must be within {INTEGRATION_WINDOW_RANGE_MS:?}"),
            ));
        }
        if !COINCIDENCE_WINDOW_RANGE_NS.contains(&self.coincidence_window_ns) {
            return Err(invalid(
                "coincidence_window_ns",
                format!("must be within {COINCIDENCE_WINDOW_RANGE_NS:?}"),
            ));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.port_path, self.baud_rate, self.read_timeout())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Crystal temperature controller of the bi-photon source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemperatureControllerConfig {
    pub port_path: String,
    #[serde(default = "default_temperature_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Timed-out reads tolerated during one `wait_for_stable`.
    #[serde(default = "default_temperature_retry_count")]
    pub retry_count: u32,
    /// Pause between temperature samples while waiting for stability.
    #[serde(default = "default_temperature_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_min_setpoint_c")]
    pub min_setpoint_c: f64,
    #[serde(default = "default_max_setpoint_c")]
    pub max_setpoint_c: f64,
    /// Consecutive in-tolerance samples required before declaring stability.
    #[serde(default = "default_stable_samples")]
    pub stable_samples: u32,
    /// Tolerance used for the passive stability flag.
    #[serde(default = "default_stability_tolerance_c")]
    pub stability_tolerance_c: f64,
}

impl TemperatureControllerConfig {
    pub fn new(port_path: impl Into<String>) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate: default_temperature_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            retry_count: default_temperature_retry_count(),
            poll_interval_ms: default_temperature_poll_interval_ms(),
            min_setpoint_c: default_min_setpoint_c(),
            max_setpoint_c: default_max_setpoint_c(),
            stable_samples: default_stable_samples(),
            stability_tolerance_c: default_stability_tolerance_c(),
        }
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = extract(&Figment::from(Toml::string(toml)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_port(
            &self.port_path,
            self.baud_rate,
            self.read_timeout_ms,
            self.retry_count,
        )?;
        validate_range("setpoint_c", self.min_setpoint_c, self.max_setpoint_c)?;
        if self.stable_samples == 0 {
            return Err(invalid("stable_samples", "must be at least 1"));
        }
        if !(self.stability_tolerance_c.is_finite() && self.stability_tolerance_c >= 0.0) {
            return Err(invalid("stability_tolerance_c", "must be zero or positive"));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.port_path, self.baud_rate, self.read_timeout())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Every instrument on the bench. Sections that are absent are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabConfig {
    #[serde(default)]
    pub delay_stage: Option<DelayStageConfig>,
    #[serde(default)]
    pub coincidence_counter: Option<CoincidenceCounterConfig>,
    #[serde(default)]
    pub temperature_controller: Option<TemperatureControllerConfig>,
}

impl LabConfig {
    /// Load `path` and apply `QOLAB_` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(&Figment::from(Toml::string(toml)))
    }

    fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Self = extract(figment)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(stage) = &self.delay_stage {
            stage.validate()?;
        }
        if let Some(counter) = &self.coincidence_counter {
            counter.validate()?;
        }
        if let Some(controller) = &self.temperature_controller {
            controller.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        DelayStageConfig::new("/dev/ttyUSB0").validate().unwrap();
        CoincidenceCounterConfig::new("/dev/ttyUSB1").validate().unwrap();
        TemperatureControllerConfig::new("/dev/ttyUSB2")
            .validate()
            .unwrap();
    }

    #[test]
    fn test_minimal_section_uses_defaults() {
        let config = DelayStageConfig::from_toml_str(r#"port_path = "/dev/ttyUSB0""#).unwrap();
        assert_eq!(config, DelayStageConfig::new("/dev/ttyUSB0"));
        assert_eq!(config.serial_settings().baud_rate, 9600);
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let err = CoincidenceCounterConfig::from_toml_str(
            r#"
            port_path = "/dev/ttyUSB1"
            retry_cout = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)), "{err}");
        assert!(err.to_string().contains("retry_cout"), "{err}");
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let err = LabConfig::from_toml_str(
            r#"
            [laser]
            port_path = "/dev/ttyUSB3"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut stage = DelayStageConfig::new("/dev/ttyUSB0");
        stage.min_position_mm = 30.0;
        assert!(matches!(
            stage.validate(),
            Err(ConfigError::Invalid {
                field: "position_mm",
                ..
            })
        ));

        let mut counter = CoincidenceCounterConfig::new("/dev/ttyUSB1");
        counter.retry_count = 0;
        assert!(matches!(
            counter.validate(),
            Err(ConfigError::Invalid {
                field: "retry_count",
                ..
            })
        ));

        let mut controller = TemperatureControllerConfig::new("");
        assert!(controller.validate().is_err());
        controller.port_path = "/dev/ttyUSB2".into();
        controller.stable_samples = 0;
        assert!(matches!(
            controller.validate(),
            Err(ConfigError::Invalid {
                field: "stable_samples",
                ..
            })
        ));
    }

    #[test]
    fn test_load_lab_file() {
        // Inside a jail so environment overrides set by other tests stay out.
        figment::Jail::expect_with(|_| {
            let mut file = tempfile::NamedTempFile::new().map_err(|e| e.to_string())?;
            writeln!(
                file,
                r#"
                [delay_stage]
                port_path = "/dev/ttyUSB0"
                retry_count = 8

                [temperature_controller]
                port_path = "/dev/ttyUSB2"
                stable_samples = 5
                "#
            )
            .map_err(|e| e.to_string())?;

            let config = LabConfig::load(file.path()).map_err(|e| e.to_string())?;
            assert_eq!(config.delay_stage.map(|stage| stage.retry_count), Some(8));
            assert_eq!(
                config.temperature_controller.map(|oven| oven.stable_samples),
                Some(5)
            );
            assert!(config.coincidence_counter.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        let err = LabConfig::load("/nonexistent/qolab.toml").unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "lab.toml",
                r#"
                [coincidence_counter]
                port_path = "/dev/ttyUSB1"
                retry_count = 2
                "#,
            )?;
            jail.set_env("QOLAB_COINCIDENCE_COUNTER__RETRY_COUNT", "6");

            let config = LabConfig::load("lab.toml").map_err(|e| e.to_string())?;
            let counter = config.coincidence_counter.ok_or("missing counter section")?;
            assert_eq!(counter.retry_count, 6);
            assert_eq!(counter.port_path, "/dev/ttyUSB1");
            Ok(())
        });
    }
}
