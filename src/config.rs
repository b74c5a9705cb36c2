//! # Printer Configuration
//!
//! One TOML file describes the motion host, the exposure device, the
//! sequencer's timing and the default print overrides.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [printer]
//! printer_name = "vat-01"
//!
//! [motion_host]
//! url = "http://localhost:7125"
//!
//! [motion.limits]
//! x_max = 125.0
//! z_max = 80.0
//!
//! [exposure]
//! i2c_address = 0x1B
//! min_brightness = 91
//! max_brightness = 1023
//!
//! [print]
//! blade_speed = 1500.0
//! led_power = 440
//! leveling_cycles = 1
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use resin_shared::ParameterOverrides;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct, constructed once at startup and passed down.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub motion_host: MotionHostConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub print: ParameterOverrides,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub printer_name: Option<String>,
}

/// Where the G-code speaking motion host lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionHostConfig {
    #[serde(default = "default_host_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for MotionHostConfig {
    fn default() -> Self {
        Self {
            url: default_host_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MotionConfig {
    #[serde(default)]
    pub limits: TravelLimits,
    #[serde(default)]
    pub timing: MotionTiming,
    #[serde(default)]
    pub job_signals: JobSignalScripts,
}

/// Travel range of both axes in mm. Targets are clamped into it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TravelLimits {
    #[serde(default)]
    pub x_min: f64,
    #[serde(default = "default_x_max")]
    pub x_max: f64,
    #[serde(default)]
    pub z_min: f64,
    #[serde(default = "default_z_max")]
    pub z_max: f64,
    /// Upper bound of X feed rates in mm/min.
    #[serde(default = "default_x_max_feed")]
    pub x_max_feed: f64,
    #[serde(default = "default_z_max_feed")]
    pub z_max_feed: f64,
}

impl Default for TravelLimits {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: default_x_max(),
            z_min: 0.0,
            z_max: default_z_max(),
            x_max_feed: default_x_max_feed(),
            z_max_feed: default_z_max_feed(),
        }
    }
}

/// Per-command timeouts and the `M400` retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionTiming {
    #[serde(default = "default_home_timeout_secs")]
    pub home_timeout_secs: u64,
    #[serde(default = "default_travel_timeout_secs")]
    pub travel_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_quick_stop_timeout_secs")]
    pub quick_stop_timeout_secs: u64,
    #[serde(default = "default_idle_attempts")]
    pub idle_attempts: u32,
    #[serde(default = "default_idle_retry_backoff_ms")]
    pub idle_retry_backoff_ms: u64,
    #[serde(default = "default_idle_settle_ms")]
    pub idle_settle_ms: u64,
    #[serde(default = "default_idle_fallback_ms")]
    pub idle_fallback_ms: u64,
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            home_timeout_secs: default_home_timeout_secs(),
            travel_timeout_secs: default_travel_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            quick_stop_timeout_secs: default_quick_stop_timeout_secs(),
            idle_attempts: default_idle_attempts(),
            idle_retry_backoff_ms: default_idle_retry_backoff_ms(),
            idle_settle_ms: default_idle_settle_ms(),
            idle_fallback_ms: default_idle_fallback_ms(),
        }
    }
}

impl MotionTiming {
    pub fn home_timeout(&self) -> Duration {
        Duration::from_secs(self.home_timeout_secs)
    }
    pub fn travel_timeout(&self) -> Duration {
        Duration::from_secs(self.travel_timeout_secs)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
    pub fn quick_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.quick_stop_timeout_secs)
    }
}

/// Scripts sent to the motion host when the job changes state, so a long
/// pause is not mistaken for an idle machine and the steppers stay powered.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSignalScripts {
    #[serde(default = "default_pause_script")]
    pub paused: String,
    #[serde(default = "default_restore_script")]
    pub resumed: String,
    #[serde(default = "default_restore_script")]
    pub cancelled: String,
    #[serde(default = "default_restore_script")]
    pub finished: String,
}

impl Default for JobSignalScripts {
    fn default() -> Self {
        Self {
            paused: default_pause_script(),
            resumed: default_restore_script(),
            cancelled: default_restore_script(),
            finished: default_restore_script(),
        }
    }
}

/// Exposure device (LED driver + projector) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExposureConfig {
    #[serde(default = "default_i2c_address")]
    pub i2c_address: u8,
    #[serde(default = "default_min_brightness")]
    pub min_brightness: u16,
    #[serde(default = "default_max_brightness")]
    pub max_brightness: u16,
    #[serde(default = "default_brightness")]
    pub default_brightness: u16,
    #[serde(default = "default_projector_gpio")]
    pub projector_gpio: u8,
    #[serde(default = "default_projector_settle_ms")]
    pub projector_settle_ms: u64,
    #[serde(default = "default_device_index")]
    pub device_index: u8,
    #[serde(default)]
    pub interface: u8,
    #[serde(default)]
    pub simulate: bool,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            i2c_address: default_i2c_address(),
            min_brightness: default_min_brightness(),
            max_brightness: default_max_brightness(),
            default_brightness: default_brightness(),
            projector_gpio: default_projector_gpio(),
            projector_settle_ms: default_projector_settle_ms(),
            device_index: default_device_index(),
            interface: 0,
            simulate: false,
        }
    }
}

/// Timing of the print sequence itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SequencerConfig {
    /// Granularity at which a stop request is observed during an exposure.
    #[serde(default = "default_exposure_poll_ms")]
    pub exposure_poll_ms: u64,
    /// Wait after a resume before motion commands are trusted again.
    #[serde(default = "default_resume_settle_ms")]
    pub resume_settle_ms: u64,
    #[serde(default = "default_leveling_lift_mm")]
    pub leveling_lift_mm: f64,
    #[serde(default = "default_blade_settle_ms")]
    pub blade_settle_ms: u64,
    #[serde(default = "default_image_attempts")]
    pub image_attempts: u32,
    #[serde(default = "default_image_retry_delay_ms")]
    pub image_retry_delay_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            exposure_poll_ms: default_exposure_poll_ms(),
            resume_settle_ms: default_resume_settle_ms(),
            leveling_lift_mm: default_leveling_lift_mm(),
            blade_settle_ms: default_blade_settle_ms(),
            image_attempts: default_image_attempts(),
            image_retry_delay_ms: default_image_retry_delay_ms(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.motion.limits;
        if limits.x_min > limits.x_max {
            return Err(ConfigError::Invalid(format!(
                "motion.limits: x_min {} exceeds x_max {}",
                limits.x_min, limits.x_max
            )));
        }
        if limits.z_min > limits.z_max {
            return Err(ConfigError::Invalid(format!(
                "motion.limits: z_min {} exceeds z_max {}",
                limits.z_min, limits.z_max
            )));
        }
        if !(limits.x_max_feed > 0.0 && limits.z_max_feed > 0.0) {
            return Err(ConfigError::Invalid(
                "motion.limits: feed rate limits must be positive".to_string(),
            ));
        }
        if self.exposure.min_brightness > self.exposure.max_brightness {
            return Err(ConfigError::Invalid(format!(
                "exposure: min_brightness {} exceeds max_brightness {}",
                self.exposure.min_brightness, self.exposure.max_brightness
            )));
        }
        if self.sequencer.exposure_poll_ms == 0 || self.sequencer.exposure_poll_ms > 100 {
            return Err(ConfigError::Invalid(
                "sequencer.exposure_poll_ms must be between 1 and 100".to_string(),
            ));
        }
        if self.sequencer.image_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sequencer.image_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_host_url() -> String { "http://localhost:7125".to_string() }
fn default_connect_timeout_secs() -> u64 { 5 }
fn default_x_max() -> f64 { 125.0 }
fn default_z_max() -> f64 { 80.0 }
fn default_x_max_feed() -> f64 { 6000.0 }
fn default_z_max_feed() -> f64 { 1200.0 }
fn default_home_timeout_secs() -> u64 { 120 }
fn default_travel_timeout_secs() -> u64 { 300 }
fn default_command_timeout_secs() -> u64 { 60 }
fn default_quick_stop_timeout_secs() -> u64 { 5 }
fn default_idle_attempts() -> u32 { 3 }
fn default_idle_retry_backoff_ms() -> u64 { 1000 }
fn default_idle_settle_ms() -> u64 { 500 }
fn default_idle_fallback_ms() -> u64 { 2000 }
fn default_pause_script() -> String { "SET_IDLE_TIMEOUT TIMEOUT=86400".to_string() }
fn default_restore_script() -> String { "SET_IDLE_TIMEOUT TIMEOUT=600".to_string() }
fn default_i2c_address() -> u8 { 0x1B }
fn default_min_brightness() -> u16 { 91 }
fn default_max_brightness() -> u16 { 1023 }
fn default_brightness() -> u16 { 440 }
fn default_projector_gpio() -> u8 { 2 }
fn default_projector_settle_ms() -> u64 { 1000 }
fn default_device_index() -> u8 { 1 }
fn default_exposure_poll_ms() -> u64 { 100 }
fn default_resume_settle_ms() -> u64 { 1000 }
fn default_leveling_lift_mm() -> f64 { 0.1 }
fn default_blade_settle_ms() -> u64 { 200 }
fn default_image_attempts() -> u32 { 3 }
fn default_image_retry_delay_ms() -> u64 { 500 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
