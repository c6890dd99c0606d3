// Motion commands and status polling for the geared rotary stage
//
// The drive runs stored motion paths: a path is configured through a block
// of registers, then started by writing a trigger code. Path 0 is homing,
// path 1 is the absolute move used for every positioning command.

use tracing::{debug, info};

use super::modbus::{ModbusBus, join_i32, split_i32};
use super::units::UnitConverter;
use crate::error::Result;
use crate::link::SerialLink;
use crate::messages::MoveParams;

/// Register addresses of the drive (protocol constants, not configuration)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    /// 3 registers: status bits, velocity (cnt/s), torque
    pub status_block: u16,
    /// 2 registers: absolute position, high word first
    pub position: u16,
    /// Path trigger / control register
    pub trigger: u16,
    pub alarm_clear: u16,
    pub homing_mode: u16,
    pub path_mode: u16,
    /// 2 registers, high word first
    pub path_position: u16,
    pub path_velocity: u16,
    pub path_acceleration: u16,
    pub path_deceleration: u16,
    pub path_dwell: u16,
}

impl RegisterMap {
    pub const DEFAULT: Self = Self {
        status_block: 0x0B05,
        position: 0x602C,
        trigger: 0x6002,
        alarm_clear: 0x1801,
        homing_mode: 0x6200,
        path_mode: 0x6208,
        path_position: 0x6209,
        path_velocity: 0x620B,
        path_acceleration: 0x620C,
        path_deceleration: 0x620D,
        path_dwell: 0x620E,
    };
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub const ALARM_CLEAR_CODE: u16 = 0x1111;
pub const HOMING_MODE: u16 = 0x0003;
pub const ABSOLUTE_MODE: u16 = 0x0001;
pub const TRIGGER_HOMING_PATH: u16 = 0x0010;
pub const TRIGGER_MOVE_PATH: u16 = 0x0011;
pub const EMERGENCY_STOP: u16 = 0x0040;

/// Status word bits
const STATUS_READY: u16 = 0x0001;
const STATUS_RUNNING: u16 = 0x0002;
const STATUS_FAULT: u16 = 0x0004;
const STATUS_HOMED: u16 = 0x0008;

/// One verified poll of the drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StagePoll {
    pub ready: bool,
    pub running: bool,
    pub faulted: bool,
    pub homed: bool,
    /// cnt/s
    pub velocity: i16,
    pub torque: i16,
    pub position: i32,
}

/// Decoded trigger register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// Path finished positioning, drive idle
    Complete { path: u8 },
    /// Trigger written, not yet picked up by the drive
    Pending { path: u8 },
    /// Reset or emergency stop not yet accepted
    StopPending,
    InMotion { path: u8 },
    /// Done and waiting for the next positioning command
    AwaitingNext,
    Unknown(u16),
}

impl PathStatus {
    pub fn decode(word: u16) -> Self {
        let path = (word & 0x000F) as u8;
        match word {
            0x0000..=0x000F => Self::Complete { path },
            0x0010..=0x001F => Self::Pending { path },
            0x0020 | 0x0040 => Self::StopPending,
            0x0100..=0x010F => Self::InMotion { path },
            0x0200 => Self::AwaitingNext,
            other => Self::Unknown(other),
        }
    }
}

pub struct StageDriver<L: SerialLink> {
    bus: ModbusBus<L>,
    registers: RegisterMap,
    units: UnitConverter,
}

impl<L: SerialLink> StageDriver<L> {
    pub fn new(bus: ModbusBus<L>, registers: RegisterMap, units: UnitConverter) -> Self {
        Self {
            bus,
            registers,
            units,
        }
    }

    pub fn units(&self) -> &UnitConverter {
        &self.units
    }

    /// Clear latched alarms; done once after every (re)connect
    pub fn clear_alarm(&mut self) -> Result<()> {
        info!("Clearing stage alarms (slave {})", self.bus.slave());
        self.bus.write_register(self.registers.alarm_clear, ALARM_CLEAR_CODE)
    }

    /// Read the status block and the absolute position; both must succeed
    pub fn poll(&mut self) -> Result<StagePoll> {
        let block = self.bus.read_holding(self.registers.status_block, 3)?;
        let position = self.bus.read_holding(self.registers.position, 2)?;

        let word = block[0];
        Ok(StagePoll {
            ready: word & STATUS_READY != 0,
            running: word & STATUS_RUNNING != 0,
            faulted: word & STATUS_FAULT != 0,
            homed: word & STATUS_HOMED != 0,
            velocity: block[1] as i16,
            torque: block[2] as i16,
            position: join_i32(position[0], position[1]),
        })
    }

    pub fn home(&mut self) -> Result<()> {
        info!("Stage homing");
        self.bus.write_register(self.registers.homing_mode, HOMING_MODE)?;
        self.bus.write_register(self.registers.trigger, TRIGGER_HOMING_PATH)
    }

    /// Configure the move path and trigger it
    ///
    /// The parameter writes and the trigger are separate transactions. A
    /// failure part way leaves earlier parameters written and no trigger.
    pub fn move_to(&mut self, params: &MoveParams, zero_offset: i32) -> Result<i32> {
        let target = self.units.degrees_to_counts(params.target_deg, zero_offset);
        debug!(
            "Stage move: {:+.3} deg -> {} cnt (zero {}), vel={} acc={} dwell={}",
            params.target_deg, target, zero_offset, params.velocity, params.acceleration, params.dwell
        );

        let r = self.registers;
        self.bus.write_register(r.path_mode, ABSOLUTE_MODE)?;
        self.bus.write_registers(r.path_position, &split_i32(target))?;
        self.bus.write_register(r.path_velocity, params.velocity)?;
        self.bus.write_register(r.path_acceleration, params.acceleration)?;
        self.bus.write_register(r.path_deceleration, params.acceleration)?;
        self.bus.write_register(r.path_dwell, params.dwell)?;
        self.bus.write_register(r.trigger, TRIGGER_MOVE_PATH)?;
        Ok(target)
    }

    pub fn estop(&mut self) -> Result<()> {
        info!("Stage emergency stop");
        self.bus.write_register(self.registers.trigger, EMERGENCY_STOP)
    }

    pub fn read_path_status(&mut self) -> Result<PathStatus> {
        let word = self.bus.read_holding(self.registers.trigger, 1)?;
        Ok(PathStatus::decode(word[0]))
    }
}
