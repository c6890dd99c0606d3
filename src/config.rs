// Runtime configuration (TOML), zero-offset store (JSON) and schedule loading
//
// Device sections are optional: a missing section means that worker is not
// started. Inside a present section the port, baud rate and device id are
// required.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::link::PortSettings;
use crate::schedule::{Command, SAMPLE_SCHEDULE, ScheduleError, parse_schedule};
use crate::servo::OperatingMode;
use crate::stage::UnitConverter;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Offset store error: {0}")]
    Offset(#[from] serde_json::Error),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub stage: Option<StageConfig>,
    pub panel: Option<PanelConfig>,
    pub servo: Option<ServoConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Status publish rate
    pub publish_hz: u64,
    /// Topic root, e.g. "rig" -> "rig/cmd/stage"
    pub topic_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            publish_hz: 20,
            topic_prefix: "rig".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub port: String,
    pub baud_rate: u32,
    pub slave_id: u8,
    #[serde(default = "default_stage_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u8,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_gear_ratio")]
    pub gear_ratio: f64,
    #[serde(default = "default_counts_per_revolution")]
    pub counts_per_revolution: f64,
    #[serde(default)]
    pub zero_offset: i32,
    #[serde(default = "default_schedule_path")]
    pub schedule_path: PathBuf,
    #[serde(default = "default_offset_path")]
    pub offset_path: PathBuf,
    #[serde(default = "default_velocity")]
    pub default_velocity: u16,
    #[serde(default = "default_acceleration")]
    pub default_acceleration: u16,
    /// Named angles in degrees
    #[serde(default)]
    pub presets: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanelConfig {
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_panel_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_signal")]
    pub signal: u8,
    #[serde(default = "default_brightness")]
    pub brightness: [u8; 6],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServoConfig {
    pub port: String,
    pub baud_rate: u32,
    pub motor_id: u8,
    #[serde(default = "default_servo_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_servo_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_scan_first")]
    pub scan_first: u8,
    #[serde(default = "default_scan_last")]
    pub scan_last: u8,
    #[serde(default = "default_operating_mode")]
    pub operating_mode: OperatingMode,
    #[serde(default = "default_profile_velocity")]
    pub profile_velocity: u32,
    #[serde(default = "default_profile_acceleration")]
    pub profile_acceleration: u32,
}

fn default_stage_tick_ms() -> u64 {
    100
}
fn default_panel_tick_ms() -> u64 {
    10
}
fn default_servo_tick_ms() -> u64 {
    50
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_servo_timeout_ms() -> u64 {
    50
}
fn default_retries() -> u8 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_gear_ratio() -> f64 {
    crate::stage::units::GEAR_RATIO
}
fn default_counts_per_revolution() -> f64 {
    crate::stage::units::COUNTS_PER_REVOLUTION
}
fn default_schedule_path() -> PathBuf {
    PathBuf::from("schedule.txt")
}
fn default_offset_path() -> PathBuf {
    PathBuf::from("offset.json")
}
fn default_velocity() -> u16 {
    2
}
fn default_acceleration() -> u16 {
    100
}
fn default_signal() -> u8 {
    1
}
fn default_brightness() -> [u8; 6] {
    [0xFF, 0xFF, 0x80, 0x40, 0x20, 0x00]
}
fn default_scan_first() -> u8 {
    1
}
fn default_scan_last() -> u8 {
    10
}
fn default_operating_mode() -> OperatingMode {
    OperatingMode::ExtendedPosition
}
fn default_profile_velocity() -> u32 {
    100
}
fn default_profile_acceleration() -> u32 {
    50
}

impl RigConfig {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.runtime.publish_hz == 0 {
            return invalid("runtime.publish_hz must be > 0".into());
        }
        if self.runtime.topic_prefix.trim().is_empty() {
            return invalid("runtime.topic_prefix must not be empty".into());
        }

        let devices = [
            self.stage.as_ref().map(|s| ("stage", s.port.as_str(), s.baud_rate, s.tick_ms)),
            self.panel.as_ref().map(|p| ("panel", p.port.as_str(), p.baud_rate, p.tick_ms)),
            self.servo.as_ref().map(|s| ("servo", s.port.as_str(), s.baud_rate, s.tick_ms)),
        ];
        for (name, port, baud_rate, tick_ms) in devices.into_iter().flatten() {
            if port.trim().is_empty() {
                return invalid(format!("{}.port must not be empty", name));
            }
            if baud_rate == 0 {
                return invalid(format!("{}.baud_rate must be > 0", name));
            }
            if tick_ms == 0 {
                return invalid(format!("{}.tick_ms must be > 0", name));
            }
        }

        if let Some(stage) = &self.stage {
            if stage.gear_ratio <= 0.0 || stage.counts_per_revolution <= 0.0 {
                return invalid("stage.gear_ratio and stage.counts_per_revolution must be > 0".into());
            }
        }

        if let Some(servo) = &self.servo {
            if servo.scan_first > servo.scan_last {
                return invalid(format!(
                    "servo scan range {}..={} is empty",
                    servo.scan_first, servo.scan_last
                ));
            }
            if !(servo.scan_first..=servo.scan_last).contains(&servo.motor_id) {
                return invalid(format!(
                    "servo.motor_id {} is outside the scan range {}..={}",
                    servo.motor_id, servo.scan_first, servo.scan_last
                ));
            }
        }
        Ok(())
    }
}

impl StageConfig {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            path: self.port.clone(),
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn units(&self) -> UnitConverter {
        UnitConverter::new(self.gear_ratio, self.counts_per_revolution)
    }
}

impl PanelConfig {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            path: self.port.clone(),
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl ServoConfig {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            path: self.port.clone(),
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Persisted zero offset: `{"zoffset": <counts>}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct OffsetFile {
    zoffset: i32,
}

#[derive(Debug, Clone)]
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored offset, or `default` when the file is missing or unreadable
    pub fn load_or(&self, default: i32) -> i32 {
        match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<OffsetFile>(&text) {
                Ok(file) => {
                    info!("Zero offset {} loaded from {}", file.zoffset, self.path.display());
                    file.zoffset
                }
                Err(e) => {
                    warn!("Ignoring malformed {}: {}", self.path.display(), e);
                    default
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => default,
            Err(e) => {
                warn!("Cannot read {}: {}", self.path.display(), e);
                default
            }
        }
    }

    pub fn save(&self, zoffset: i32) -> Result<(), ConfigError> {
        let json = serde_json::to_string(&OffsetFile { zoffset })?;
        fs::write(&self.path, json).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!("Zero offset {} saved to {}", zoffset, self.path.display());
        Ok(())
    }
}

/// Parse the schedule file; a missing file falls back to the sample schedule
pub fn load_schedule(path: &Path) -> Result<Vec<Command>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("{} not found, using the sample schedule", path.display());
            SAMPLE_SCHEDULE.to_string()
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(parse_schedule(&text)?)
}
