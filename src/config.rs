//! Sensor configuration.
//!
//! [`Config`] is the raw, user-facing surface (parsed by clap in the binary).
//! It is validated once, at construction, into [`SensorSettings`]; nothing
//! downstream sees an unvalidated value.

use crate::reading::Millis;
use clap::Args;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BATTERY_VOLTAGE_MIN: u16 = 1800;
pub const DEFAULT_BATTERY_VOLTAGE_MAX: u16 = 3200;
pub const DEFAULT_BATTERY_VOLTAGE_LOW: u16 = 2000;
/// 30 minutes.
pub const DEFAULT_MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Errors detected while validating configuration. All are fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Name missing from configuration.")]
    MissingName,
    #[error("Device name missing from configuration.")]
    MissingDeviceName,
    #[error("Invalid battery calibration: minimum {min} mV must be below maximum {max} mV")]
    InvalidCalibration { min: u16, max: u16 },
    #[error("Invalid max update interval: {0:?} does not fit in milliseconds")]
    InvalidUpdateInterval(Duration),
}

/// User-facing sensor configuration.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct Config {
    /// Display name of the exposed sensor services
    #[arg(long)]
    pub name: Option<String>,

    /// Advertised BLE local name of the beacon (exact, case-sensitive match)
    #[arg(long)]
    pub device_name: Option<String>,

    /// Battery voltage reported as 0%, in millivolts
    #[arg(long, default_value_t = DEFAULT_BATTERY_VOLTAGE_MIN)]
    pub battery_voltage_min: u16,

    /// Battery voltage reported as 100%, in millivolts
    #[arg(long, default_value_t = DEFAULT_BATTERY_VOLTAGE_MAX)]
    pub battery_voltage_max: u16,

    /// Battery voltage below which the battery is reported low, in millivolts
    #[arg(long, default_value_t = DEFAULT_BATTERY_VOLTAGE_LOW)]
    pub battery_voltage_low: u16,

    /// How long a reading stays valid without a new advertisement.
    /// Accepts duration with suffix: 500ms, 30s, 30m, 1h.
    /// Without suffix, value is interpreted as milliseconds.
    #[arg(long, value_parser = parse_duration, default_value = "30m")]
    pub max_update_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            device_name: None,
            battery_voltage_min: DEFAULT_BATTERY_VOLTAGE_MIN,
            battery_voltage_max: DEFAULT_BATTERY_VOLTAGE_MAX,
            battery_voltage_low: DEFAULT_BATTERY_VOLTAGE_LOW,
            max_update_interval: DEFAULT_MAX_UPDATE_INTERVAL,
        }
    }
}

impl Config {
    /// Config with the required fields set and everything else defaulted.
    pub fn new(name: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            device_name: Some(device_name.into()),
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when a required field is missing or the
    /// calibration bounds are inconsistent.
    pub fn validate(&self) -> Result<SensorSettings, ConfigError> {
        let name = self.name.clone().ok_or(ConfigError::MissingName)?;
        let device_name = self
            .device_name
            .clone()
            .ok_or(ConfigError::MissingDeviceName)?;
        let max_update_interval_millis = Millis::try_from(self.max_update_interval.as_millis())
            .map_err(|_| ConfigError::InvalidUpdateInterval(self.max_update_interval))?;

        let calibration = Calibration::new(
            self.battery_voltage_min,
            self.battery_voltage_max,
            self.battery_voltage_low,
            max_update_interval_millis,
        )?;

        Ok(SensorSettings {
            name,
            device_name,
            calibration,
        })
    }
}

/// Validated settings for one sensor accessory.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub name: String,
    pub device_name: String,
    pub calibration: Calibration,
}

/// Battery calibration bounds and the freshness window.
///
/// Invariant: `battery_voltage_min < battery_voltage_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    battery_voltage_min: u16,
    battery_voltage_max: u16,
    battery_voltage_low: u16,
    max_update_interval_millis: Millis,
}

impl Calibration {
    pub fn new(
        battery_voltage_min: u16,
        battery_voltage_max: u16,
        battery_voltage_low: u16,
        max_update_interval_millis: Millis,
    ) -> Result<Self, ConfigError> {
        if battery_voltage_min >= battery_voltage_max {
            return Err(ConfigError::InvalidCalibration {
                min: battery_voltage_min,
                max: battery_voltage_max,
            });
        }

        Ok(Self {
            battery_voltage_min,
            battery_voltage_max,
            battery_voltage_low,
            max_update_interval_millis,
        })
    }

    pub fn battery_voltage_min(&self) -> u16 {
        self.battery_voltage_min
    }

    pub fn battery_voltage_max(&self) -> u16 {
        self.battery_voltage_max
    }

    pub fn battery_voltage_low(&self) -> u16 {
        self.battery_voltage_low
    }

    pub fn max_update_interval_millis(&self) -> Millis {
        self.max_update_interval_millis
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            battery_voltage_min: DEFAULT_BATTERY_VOLTAGE_MIN,
            battery_voltage_max: DEFAULT_BATTERY_VOLTAGE_MAX,
            battery_voltage_low: DEFAULT_BATTERY_VOLTAGE_LOW,
            max_update_interval_millis: DEFAULT_MAX_UPDATE_INTERVAL.as_millis() as Millis,
        }
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `ms` or no suffix: milliseconds
/// - `s`: seconds
/// - `m`: minutes
/// - `h`: hours
///
/// # Examples
/// ```
/// use ble_environmental_sensor::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
/// assert_eq!(parse_duration("1800000").unwrap(), Duration::from_secs(1800));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit_millis, unit) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1, "milliseconds")
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000, "seconds")
    } else {
        (src, 1, "duration")
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {}: {}", unit, num))?;
    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {}", src))
}
