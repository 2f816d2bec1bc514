//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/thorlabs_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `THORLABS_DAQ_`, `__` separating
//!    nested keys
//!
//! Every field has a default, so an empty file yields a working simulation
//! setup.
//!
//! # Example
//! ```no_run
//! use thorlabs_daq::config::LabConfig;
//!
//! // THORLABS_DAQ_LOCKIN__CYCLE_COUNT=3 overrides [lockin] cycle_count
//! let config = LabConfig::load()?;
//! config.validate()?;
//! println!("cycles: {}", config.lockin.cycle_count);
//! # Ok::<(), thorlabs_daq::error::DaqError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::hardware::mock::{BeamModel, CameraScene};
use crate::hardware::AxisSettings;
use crate::logging::{parse_log_level, OutputFormat};
use crate::procedures::{AutocorrelatorConfig, LockInPowerConfig};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/thorlabs_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "THORLABS_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Lock-in power measurement
    #[serde(default)]
    pub lockin: LockInPowerConfig,
    /// Autocorrelator pulse-width measurement
    #[serde(default)]
    pub autocorrelator: AutocorrelatorConfig,
    /// Simulated devices used by the CLI
    #[serde(default)]
    pub devices: DevicesConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
}

fn default_name() -> String {
    "thorlabs-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Simulated hardware.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Seed for every simulated noise source; `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub servo: ServoConfig,
    #[serde(default)]
    pub beam: BeamModel,
    #[serde(default)]
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoConfig {
    /// Time the servo takes to reach a new position.
    #[serde(default = "default_travel_time", with = "secs_f64")]
    pub travel_time: Duration,
    #[serde(default)]
    pub axis: AxisSettings,
}

fn default_travel_time() -> Duration {
    Duration::from_millis(50)
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            travel_time: default_travel_time(),
            axis: AxisSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default)]
    pub scene: CameraScene,
}

fn default_camera_width() -> u32 {
    256
}

fn default_camera_height() -> u32 {
    64
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: default_camera_width(),
            height: default_camera_height(),
            scene: CameraScene::default(),
        }
    }
}

impl LabConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        tracing::debug!(path = %path.as_ref().display(), "configuration loaded");
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level).map_err(DaqError::Configuration)?;
        self.lockin.check()?;
        self.autocorrelator.validate()?;
        self.devices
            .servo
            .axis
            .validate()
            .map_err(|e| DaqError::Configuration(format!("devices.servo.axis: {e}")))?;
        let camera = &self.devices.camera;
        if camera.width == 0 || camera.height == 0 {
            return Err(DaqError::Configuration(format!(
                "camera resolution must be non-zero, got {}x{}",
                camera.width, camera.height
            )));
        }
        Ok(())
    }
}

/// `Duration` as a float number of seconds.
pub(crate) mod secs_f64 {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {secs} s: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LabConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.lockin.servo_time_s, 1.0);
        assert_eq!(config.devices.camera.width, 256);
        config.validate().unwrap();
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"
            log_format = "json"

            [lockin]
            servo_time_s = 4.0
            wavelength_nm = 800.0
            settle_delay = 0.2

            [autocorrelator]
            shape = "sech2"
            pixel_to_fs = 0.5

            [devices]
            seed = 7

            [devices.servo.axis]
            bounds = [-500.0, 500.0]

            [devices.beam]
            signal_w = 0.002
            "#,
        );
        let config = LabConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert_eq!(config.lockin.servo_time_s, 4.0);
        assert_eq!(config.lockin.wavelength_nm, Some(800.0));
        assert_eq!(config.lockin.settle_delay, Duration::from_millis(200));
        assert_eq!(config.autocorrelator.pixel_to_fs, 0.5);
        assert_eq!(config.devices.seed, Some(7));
        assert_eq!(config.devices.servo.axis.bounds, Some((-500.0, 500.0)));
        assert_eq!(config.devices.beam.signal_w, 0.002);
        assert_eq!(config.devices.beam.background_w, BeamModel::default().background_w);
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides_file() {
        let file = write_config("[lockin]\ncycle_count = 2\n");
        std::env::set_var("THORLABS_DAQ_LOCKIN__CYCLE_COUNT", "9");
        let config = LabConfig::load_from(file.path());
        std::env::remove_var("THORLABS_DAQ_LOCKIN__CYCLE_COUNT");
        assert_eq!(config.unwrap().lockin.cycle_count, 9);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = LabConfig::default();
        config.application.log_level = "verbose".into();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));

        let mut config = LabConfig::default();
        config.autocorrelator.pixel_to_fs = -1.0;
        assert!(matches!(config.validate(), Err(DaqError::Acquisition(_))));

        let mut config = LabConfig::default();
        config.devices.camera.height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let file = write_config("[autocorrelator]\nframes = \"many\"\n");
        assert!(matches!(
            LabConfig::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }
}
