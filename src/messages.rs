// Define message types for the runtime
//
// Commands arrive as JSON on the command topics; snapshots leave as JSON on
// the state topics. Every command enum is internally tagged by "command".

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::servo::OperatingMode;

/// Parameters of one absolute stage move
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveParams {
    /// Degrees relative to the zero offset
    pub target_deg: f64,
    pub velocity: u16,
    pub acceleration: u16,
    /// Dwell after the move, drive units (ms)
    #[serde(default)]
    pub dwell: u16,
}

// Commands from GUI/scripts -> stage worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StageCommand {
    /// Move with explicit profile
    Move(MoveParams),
    /// Move with the configured default profile
    GoTo { degrees: f64 },
    /// Move relative to the last verified position
    Jog { degrees: f64 },
    /// Move to a named preset angle
    Preset { name: String },
    Home,
    #[serde(rename = "estop")]
    EStop,
    StartLoop,
    StopLoop,
    SetZeroOffset { counts: i32 },
    /// Persist the zero offset in effect after the commands queued before it
    SaveZeroOffset,
}

// Commands -> panel worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PanelCommand {
    SetSignal { signal: u8 },
    SetBrightness { values: [u8; 6] },
    SetLed { index: usize, value: u8 },
    SetAll { value: u8 },
}

// Commands -> servo worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServoCommand {
    /// Forward-only move to an angle in degrees
    MoveForward {
        degrees: f64,
        #[serde(default)]
        velocity: Option<u32>,
    },
    GoalPosition { position: i32 },
    GoalVelocity { velocity: i32 },
    TorqueOn,
    TorqueOff,
    Stop,
    SetOperatingMode { mode: OperatingMode },
    SetProfile { velocity: u32, acceleration: u32 },
}

/// Published status of one device
///
/// Replaced wholesale by the worker; readers always get a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<R> {
    pub connected: bool,
    pub error_count: u64,
    /// Unix time (ms) of the last verified exchange
    pub last_update_ms: Option<u64>,
    pub device: R,
}

impl<R: Default> Default for Snapshot<R> {
    fn default() -> Self {
        Self {
            connected: false,
            error_count: 0,
            last_update_ms: None,
            device: R::default(),
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageReading {
    pub position: i32,
    pub degrees: f64,
    /// cnt/s
    pub velocity: i16,
    pub velocity_deg_s: f64,
    pub torque: i16,
    pub ready: bool,
    pub running: bool,
    pub faulted: bool,
    pub homed: bool,
    pub zero_offset: i32,
    pub looping: bool,
    pub cycle_index: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PanelReading {
    /// Signal currently commanded
    pub signal: u8,
    pub digital_output: u8,
    pub brightness: [u8; 6],
    pub switch_bits: u8,
    pub switch_one: bool,
    pub switch_two: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServoReading {
    pub motor_id: u8,
    pub position: i32,
    /// Single-turn angle, degrees
    pub angle: f64,
    pub velocity: i32,
    pub current: i16,
    pub temperature: u8,
    pub voltage: f64,
    pub moving: bool,
}
