//! Persistent rig settings, stored as TOML.

use gonio_lib::constants::{
    ACK_TIMEOUT, COMMAND_DELAY, DEFAULT_BAUD_RATE, DEFAULT_DEVICE_REGEX, DEFAULT_SEPARATOR, READ_TIMEOUT,
};
use chrono::format::{Item, StrftimeItems};
use gonio_lib::{IntensityConversion, Resolution, ScanConfig, SerialSettings, Vocabulary};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Reserved-word set spoken by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `START`/`STOP`/`CALIBRATE`, `DATA`/`END`/`ACK`
    #[default]
    Standard,
    /// Abbreviated words of the Arduino firmware
    Firmware,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Serial port; when unset the port is picked by `regex`
    pub port: Option<String>,
    pub regex: String,
    pub baud_rate: u32,
    pub dialect: Dialect,
    /// Overrides the dialect's separator
    pub separator: Option<char>,
    pub ack_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub command_delay_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: None,
            regex: DEFAULT_DEVICE_REGEX.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            dialect: Dialect::Standard,
            separator: None,
            ack_timeout_ms: ACK_TIMEOUT.as_millis() as u64,
            read_timeout_ms: READ_TIMEOUT.as_millis() as u64,
            command_delay_ms: COMMAND_DELAY.as_millis() as u64,
        }
    }
}

/// Angular resolution and motor step sizes, degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub res_theta: f32,
    pub res_phi: f32,
    pub dps_theta: f32,
    pub dps_phi: f32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            res_theta: 0.5,
            res_phi: 0.5,
            dps_theta: 0.5,
            dps_phi: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Source to sensor, metres
    pub distance_m: f64,
    /// Sensor gain, lux per volt
    pub volts_to_lux: f64,
    /// Dark offset written by calibration, volts
    pub offset_v: f64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            distance_m: 1.0,
            volts_to_lux: 1.0,
            offset_v: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultSettings {
    /// Compute flux and FWHM after a measurement
    pub photometry: bool,
    pub directory: PathBuf,
    /// `chrono` format string for the file name prefix
    pub prefix_format: String,
    pub csv_separator: char,
    /// Also write a bare table under `raws/` for normally finished runs
    pub store_raw: bool,
}

impl Default for ResultSettings {
    fn default() -> Self {
        Self {
            photometry: true,
            directory: PathBuf::from("results"),
            prefix_format: "%y_%m_%d-%Hh%M".to_string(),
            csv_separator: DEFAULT_SEPARATOR,
            store_raw: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceSettings,
    pub scan: ScanSettings,
    pub sensor: SensorSettings,
    pub results: ResultSettings,
}

impl Settings {
    /// Loads `path`; a missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let settings: Settings = toml::from_str(&text)?;
                debug!(path = %path.display(), "configuration loaded");
                Ok(settings)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no configuration file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolution()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let scan = &self.scan;
        if !(scan.dps_theta > 0.0 && scan.dps_phi > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "degrees per step must be positive, got {} and {}",
                scan.dps_theta, scan.dps_phi
            )));
        }
        if !(self.sensor.distance_m > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sensor distance must be positive, got {}",
                self.sensor.distance_m
            )));
        }
        if self.results.csv_separator.len_utf8() != 1 {
            return Err(ConfigError::Invalid(format!(
                "CSV separator must be a single-byte character, got '{}'",
                self.results.csv_separator
            )));
        }
        if StrftimeItems::new(&self.results.prefix_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::Invalid(format!(
                "result prefix format '{}' is not a valid date format",
                self.results.prefix_format
            )));
        }
        Ok(())
    }

    pub fn vocabulary(&self) -> Vocabulary {
        let vocabulary = match self.device.dialect {
            Dialect::Standard => Vocabulary::default(),
            Dialect::Firmware => Vocabulary::firmware(),
        };
        match self.device.separator {
            Some(separator) => vocabulary.with_separator(separator),
            None => vocabulary,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.scan.res_theta, self.scan.res_phi)
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            res_theta: self.scan.res_theta,
            res_phi: self.scan.res_phi,
            dps_theta: self.scan.dps_theta,
            dps_phi: self.scan.dps_phi,
        }
    }

    pub fn conversion(&self) -> IntensityConversion {
        IntensityConversion {
            offset_v: self.sensor.offset_v,
            volts_to_lux: self.sensor.volts_to_lux,
            distance_m: self.sensor.distance_m,
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.device.port.clone(),
            device_regex: self.device.regex.clone(),
            baud_rate: self.device.baud_rate,
            read_timeout: Duration::from_millis(self.device.read_timeout_ms),
            command_delay: Duration::from_millis(self.device.command_delay_ms),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.device.ack_timeout_ms)
    }
}
