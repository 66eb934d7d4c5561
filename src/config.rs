//! Configuration system using Figment.
//!
//! Provides strongly-typed configuration loading for the capture daemon.
//! Configuration is loaded from:
//! 1. Built-in defaults
//! 2. A TOML file (`analemma.toml` by default)
//! 3. Environment variables (prefixed with `ANALEMMA_`, `__`-separated)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! ANALEMMA_LOGGING__LEVEL=debug
//! ANALEMMA_SCHEDULE__CAPTURE_TIME="11:30"
//! ANALEMMA_STORAGE__MIN_FREE_SPACE_MB=2048
//! ```
//!
//! The configuration is immutable once loaded for a run; the daemon never
//! reloads it mid-run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "analemma.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Camera configuration snapshot applied to every capture.
    #[serde(default)]
    pub camera: CameraConfig,
    /// Daily trigger time and timezone.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Image destination and capacity guard.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retry/backoff bounds for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            schedule: ScheduleConfig::default(),
            storage: StorageConfig::default(),
            retry: RetryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Supported on-disk image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Fits,
    Png,
}

impl ImageType {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageType::Fits => "fits",
            ImageType::Png => "png",
        }
    }
}

/// Camera configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera driver to use. Only the built-in simulator ships with the
    /// crate; vendor SDK drivers plug in behind the `CameraPort` trait.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Exposure time in microseconds. 1ms suits solar photography.
    #[serde(default = "default_exposure_us")]
    pub exposure_us: u32,
    /// Sensor gain (0-300).
    #[serde(default)]
    pub gain: u32,
    /// Output image format.
    #[serde(default = "default_image_type")]
    pub image_type: ImageType,
    /// White balance, red channel.
    #[serde(default = "default_wb_r")]
    pub wb_r: u32,
    /// White balance, blue channel.
    #[serde(default = "default_wb_b")]
    pub wb_b: u32,
    /// Bound on a single frame acquisition.
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
}

fn default_driver() -> String {
    "sim".to_string()
}

fn default_exposure_us() -> u32 {
    1000
}

fn default_image_type() -> ImageType {
    ImageType::Fits
}

fn default_wb_r() -> u32 {
    52
}

fn default_wb_b() -> u32 {
    95
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            exposure_us: default_exposure_us(),
            gain: 0,
            image_type: default_image_type(),
            wb_r: default_wb_r(),
            wb_b: default_wb_b(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Schedule configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local wall-clock trigger time, `HH:MM` (24-hour).
    #[serde(default = "default_capture_time")]
    pub capture_time: String,
    /// IANA timezone identifier the trigger time is resolved in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_capture_time() -> String {
    "12:00".to_string()
}

fn default_timezone() -> String {
    "Asia/Tokyo".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            capture_time: default_capture_time(),
            timezone: default_timezone(),
        }
    }
}

/// Parsed, validated form of [`ScheduleConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub time: NaiveTime,
    pub tz: Tz,
}

impl ScheduleConfig {
    /// Parse the raw strings into a timezone-resolved schedule spec.
    pub fn parse(&self) -> Result<ScheduleSpec, ConfigError> {
        let time = NaiveTime::parse_from_str(&self.capture_time, "%H:%M").map_err(|_| {
            ConfigError::Validation(format!(
                "capture_time must be in HH:MM format (24-hour), got '{}'",
                self.capture_time
            ))
        })?;
        let tz: Tz = self.timezone.parse().map_err(|_| {
            ConfigError::Validation(format!("invalid timezone: '{}'", self.timezone))
        })?;
        Ok(ScheduleSpec { time, tz })
    }
}

/// Storage configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for captured images.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Partition images into `YYYY-MM/` subdirectories.
    #[serde(default = "default_true")]
    pub monthly_subfolders: bool,
    /// Minimum free space required before a capture is attempted.
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
    /// Record a SHA-256 checksum of each image in its metadata record.
    #[serde(default = "default_true")]
    pub checksum: bool,
    /// Where day-level schedule state is persisted. Defaults to
    /// `<base_path>/schedule_state.json`.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("images")
}

fn default_true() -> bool {
    true
}

fn default_min_free_space_mb() -> u64 {
    1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            monthly_subfolders: true,
            min_free_space_mb: default_min_free_space_mb(),
            checksum: true,
            state_file: None,
        }
    }
}

impl StorageConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.base_path.join("schedule_state.json"))
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_space_mb.saturating_mul(1024 * 1024)
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error). Overridable at
    /// runtime via `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load configuration from the default file location and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ANALEMMA_").split("__"))
            .extract()
            .map_err(ConfigError::Load)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Camera driver is known
    /// - Exposure is positive and gain is within the sensor's range
    /// - Capture time parses as HH:MM and the timezone is a valid IANA id
    /// - Retry bounds are sane
    /// - Log level is valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_drivers = ["sim"];
        if !valid_drivers.contains(&self.camera.driver.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Unknown camera driver '{}'. Must be one of: {}",
                self.camera.driver,
                valid_drivers.join(", ")
            )));
        }

        if self.camera.exposure_us == 0 {
            return Err(ConfigError::Validation(
                "exposure_us must be positive".to_string(),
            ));
        }

        if self.camera.gain > 300 {
            return Err(ConfigError::Validation(format!(
                "gain must be between 0 and 300, got {}",
                self.camera.gain
            )));
        }

        self.schedule.parse()?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::Validation(
                "retry.initial_delay must not exceed retry.max_delay".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid logging level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.camera.exposure_us, 1000);
        assert_eq!(settings.camera.image_type, ImageType::Fits);
        assert_eq!(settings.schedule.capture_time, "12:00");
    }

    #[test]
    fn test_schedule_parse() {
        let schedule = ScheduleConfig {
            capture_time: "09:30".to_string(),
            timezone: "America/New_York".to_string(),
        };
        let spec = schedule.parse().expect("valid schedule");
        assert_eq!(
            spec.time,
            NaiveTime::from_hms_opt(9, 30, 0).expect("valid time")
        );
        assert_eq!(spec.tz, chrono_tz::America::New_York);
    }

    #[test]
    fn test_invalid_capture_time_rejected() {
        let schedule = ScheduleConfig {
            capture_time: "25:99".to_string(),
            ..ScheduleConfig::default()
        };
        assert!(schedule.parse().is_err());

        let schedule = ScheduleConfig {
            capture_time: "noon".to_string(),
            ..ScheduleConfig::default()
        };
        assert!(schedule.parse().is_err());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let schedule = ScheduleConfig {
            timezone: "Mars/Olympus_Mons".to_string(),
            ..ScheduleConfig::default()
        };
        assert!(schedule.parse().is_err());
    }

    #[test]
    fn test_invalid_gain_rejected() {
        let mut settings = Settings::default();
        settings.camera.gain = 500;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_exposure_rejected() {
        let mut settings = Settings::default();
        settings.camera.exposure_us = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_state_path_defaults_under_base() {
        let storage = StorageConfig {
            base_path: PathBuf::from("/data/images"),
            ..StorageConfig::default()
        };
        assert_eq!(
            storage.state_path(),
            PathBuf::from("/data/images/schedule_state.json")
        );
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let settings =
            Settings::load_from("/nonexistent/analemma.toml").expect("defaults should load");
        assert_eq!(settings.storage.min_free_space_mb, 1024);
    }
}
