//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/spectro.toml`; a missing file is skipped)
//! 3. Environment variables prefixed with `SPECTRO_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SPECTRO_APPLICATION__LOG_LEVEL=debug
//! SPECTRO_DEVICE__NATIVE_INTEGRATION_TIME=10ms
//! SPECTRO_SESSION__RESUME_AFTER_ONE_SHOT=true
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spectro_daq::config::SpectroConfig;
//!
//! let config = SpectroConfig::load_from("config/spectro.toml")?;
//! println!("Native integration time: {:?}", config.device.native_integration_time);
//! # Ok::<(), spectro_daq::error::DaqError>(())
//! ```

use crate::data::StorageFormat;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/spectro.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectroConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Spectrometer settings
    pub device: DeviceConfig,
    /// Continuous acquisition settings
    pub acquisition: AcquisitionConfig,
    /// Dark reference settings
    pub calibration: CalibrationConfig,
    /// Live session settings
    pub session: SessionConfig,
    /// Array file settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (text or json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "spectro_daq".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

/// Spectrometer configuration. The simulated device uses every field; real
/// hardware only `id` and `native_integration_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identity, part of the dark cache key
    pub id: String,
    /// Native per-frame integration time, set once at startup
    #[serde(with = "humantime_serde")]
    pub native_integration_time: Duration,
    /// Number of pixels on the detector
    pub pixels: usize,
    /// First wavelength in nm
    pub wavelength_start_nm: f64,
    /// Last wavelength in nm
    pub wavelength_end_nm: f64,
    /// Simulated dark pedestal in counts
    pub dark_level: f64,
    /// Simulated uniform noise amplitude in counts
    pub noise_amplitude: f64,
    /// Probability of a simulated transient transfer error per read
    pub failure_rate: f64,
    /// Pace simulated reads at the integration time
    pub simulate_timing: bool,
    /// Seed for simulated noise
    pub seed: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "mock-spectrometer".to_string(),
            native_integration_time: Duration::from_millis(200),
            pixels: 2048,
            wavelength_start_nm: 340.0,
            wavelength_end_nm: 1030.0,
            dark_level: 1500.0,
            noise_amplitude: 12.0,
            failure_rate: 0.01,
            simulate_timing: true,
            seed: 7,
        }
    }
}

/// Continuous acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Exposure of each continuous preview tick
    #[serde(with = "humantime_serde")]
    pub default_exposure: Duration,
    /// Retry policy for transient read errors
    pub retry: RetryPolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            default_exposure: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

/// Dark reference configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Total exposure averaged into the dark reference
    #[serde(with = "humantime_serde")]
    pub reference_exposure: Duration,
    /// Dark cache file
    pub cache_path: PathBuf,
    /// Ignore the cache at startup
    pub force_refresh: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_exposure: Duration::from_secs(60),
            cache_path: PathBuf::from("dark_spectrum.bin"),
            force_refresh: false,
        }
    }
}

/// Live session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Enable the acquire/restart variant of the controller
    pub supports_one_shot: bool,
    /// Return to continuous mode automatically after a one-shot acquisition
    pub resume_after_one_shot: bool,
    /// Requested exposure before the operator sets one
    #[serde(with = "humantime_serde")]
    pub initial_requested_exposure: Duration,
    /// Substituted when the operator enters an unreadable exposure
    #[serde(with = "humantime_serde")]
    pub fallback_exposure: Duration,
    /// Wait between drain points while paused
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,
    /// Default destination of the save command
    pub export_path: PathBuf,
    /// Initial y-axis bounds `[lower, upper]`
    pub y_limits: [f64; 2],
    /// Autoscale sets the upper bound to this factor times the maximum
    pub autoscale_headroom: f64,
    /// Operator command queue capacity
    pub command_channel_capacity: usize,
    /// Display update broadcast capacity
    pub update_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            supports_one_shot: true,
            resume_after_one_shot: false,
            initial_requested_exposure: Duration::from_secs(1),
            fallback_exposure: Duration::from_millis(100),
            idle_poll: Duration::from_millis(100),
            export_path: PathBuf::from("data.bin"),
            y_limits: [-30.0, 1000.0],
            autoscale_headroom: 1.2,
            command_channel_capacity: 32,
            update_channel_capacity: 16,
        }
    }
}

/// Array file configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Format of the dark cache and exports
    pub format: StorageFormat,
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SpectroConfig {
    /// Loads from [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads defaults, then `path`, then `SPECTRO_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SpectroConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPECTRO_").split("__"))
    }

    /// Rejects semantically invalid settings.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        let device = &self.device;
        if device.native_integration_time.is_zero() {
            return invalid("device.native_integration_time must be > 0".to_string());
        }
        if device.pixels == 0 {
            return invalid("device.pixels must be > 0".to_string());
        }
        if device.wavelength_end_nm <= device.wavelength_start_nm {
            return invalid(format!(
                "device wavelength range {}..{} nm must be increasing",
                device.wavelength_start_nm, device.wavelength_end_nm
            ));
        }
        if !(0.0..1.0).contains(&device.failure_rate) {
            return invalid(format!(
                "device.failure_rate {} must be in [0, 1)",
                device.failure_rate
            ));
        }

        if self.acquisition.default_exposure.is_zero() {
            return invalid("acquisition.default_exposure must be > 0".to_string());
        }

        if self.calibration.reference_exposure < device.native_integration_time {
            return invalid(format!(
                "calibration.reference_exposure ({:?}) must be at least the native integration time ({:?})",
                self.calibration.reference_exposure, device.native_integration_time
            ));
        }

        let session = &self.session;
        if session.fallback_exposure.is_zero() || session.initial_requested_exposure.is_zero() {
            return invalid("session exposures must be > 0".to_string());
        }
        if !(session.autoscale_headroom > 0.0) {
            return invalid("session.autoscale_headroom must be > 0".to_string());
        }
        if !(session.y_limits[0] < session.y_limits[1]) {
            return invalid(format!(
                "session.y_limits {:?} must be [lower, upper] with lower < upper",
                session.y_limits
            ));
        }
        if session.command_channel_capacity == 0 || session.update_channel_capacity == 0 {
            return invalid("session channel capacities must be > 0".to_string());
        }

        Ok(())
    }
}
