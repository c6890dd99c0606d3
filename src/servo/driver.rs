// High-level servo API: discovery, torque, goal positions and the
// forward-only multi-turn move used by the rig

use tracing::{debug, info};

use super::protocol::{Field, OperatingMode, ServoBus};
use crate::error::Result;
use crate::link::SerialLink;

/// Encoder steps per revolution
pub const RESOLUTION: i32 = 4096;
pub const MIN_POSITION: i32 = 0;
pub const MAX_POSITION: i32 = RESOLUTION - 1;

/// One verified status read
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ServoPoll {
    /// Multi-turn position in steps
    pub position: i32,
    pub velocity: i32,
    pub current: i16,
    /// Celsius
    pub temperature: u8,
    /// Volts
    pub voltage: f64,
    pub moving: bool,
}

/// Result of a forward-only move
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardMove {
    pub from: i32,
    pub to: i32,
    /// Degrees travelled forward
    pub delta: f64,
}

/// Single-turn angle of a multi-turn position, in [0, 360)
pub fn position_to_angle(position: i32) -> f64 {
    f64::from(position.rem_euclid(RESOLUTION)) / f64::from(RESOLUTION) * 360.0
}

/// Forward-only angular distance from `current` to `target`
///
/// The mechanism only turns one way, so a target behind the current angle
/// is reached by wrapping through 360. Re-commanding the previous target
/// produces a full turn rather than no motion.
pub fn forward_delta(current: f64, target: f64, previous_target: Option<f64>) -> f64 {
    if previous_target == Some(target) {
        return 360.0;
    }
    if target >= current {
        target - current
    } else {
        (360.0 - current) + target
    }
}

/// Raw goal for a forward move from `position` to `target` degrees
pub fn forward_goal(position: i32, target: f64, previous_target: Option<f64>) -> (i32, f64) {
    let delta = forward_delta(position_to_angle(position), target, previous_target);
    let steps = (delta / 360.0 * f64::from(RESOLUTION)).round() as i32;
    (position.saturating_add(steps), delta)
}

pub struct ServoDriver<L: SerialLink> {
    bus: ServoBus<L>,
    last_target: Option<f64>,
}

impl<L: SerialLink> ServoDriver<L> {
    pub fn new(bus: ServoBus<L>) -> Self {
        Self {
            bus,
            last_target: None,
        }
    }

    /// Ping every id in the range; returns (id, model number) for each responder
    pub fn scan(&mut self, ids: std::ops::RangeInclusive<u8>) -> Result<Vec<(u8, u16)>> {
        let mut found = Vec::new();
        for id in ids {
            if let Some(model) = self.bus.ping(id)? {
                info!("Servo {} found (model {})", id, model);
                found.push((id, model));
            }
        }
        Ok(found)
    }

    pub fn enable_torque(&mut self, id: u8) -> Result<()> {
        info!("Servo {} torque on", id);
        self.bus.write(id, Field::TorqueEnable, 1)
    }

    pub fn disable_torque(&mut self, id: u8) -> Result<()> {
        info!("Servo {} torque off", id);
        self.bus.write(id, Field::TorqueEnable, 0)
    }

    /// Set operating mode (torque must already be off)
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        info!("Servo {} operating mode {:?}", id, mode);
        self.bus.write(id, Field::OperatingMode, mode as u32)
    }

    /// Torque off, change mode, torque back on
    pub fn change_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.disable_torque(id)?;
        self.set_operating_mode(id, mode)?;
        self.enable_torque(id)
    }

    pub fn operating_mode(&mut self, id: u8) -> Result<u8> {
        Ok(self.bus.read(id, Field::OperatingMode)? as u8)
    }

    /// Single-turn goal, clamped to 0..=4095
    pub fn set_goal_position(&mut self, id: u8, position: i32) -> Result<()> {
        let clamped = position.clamp(MIN_POSITION, MAX_POSITION);
        self.bus.write(id, Field::GoalPosition, clamped as u32)
    }

    /// Multi-turn goal, unclamped (extended position mode)
    pub fn set_extended_goal_position(&mut self, id: u8, position: i32) -> Result<()> {
        self.bus.write(id, Field::GoalPosition, position as u32)
    }

    pub fn set_goal_velocity(&mut self, id: u8, velocity: i32) -> Result<()> {
        self.bus.write(id, Field::GoalVelocity, velocity as u32)
    }

    /// Stop by commanding zero velocity (velocity mode)
    pub fn stop(&mut self, id: u8) -> Result<()> {
        info!("Servo {} stop", id);
        self.set_goal_velocity(id, 0)
    }

    pub fn set_profile_velocity(&mut self, id: u8, velocity: u32) -> Result<()> {
        self.bus.write(id, Field::ProfileVelocity, velocity)
    }

    pub fn set_profile_acceleration(&mut self, id: u8, acceleration: u32) -> Result<()> {
        self.bus.write(id, Field::ProfileAcceleration, acceleration)
    }

    pub fn get_present_position(&mut self, id: u8) -> Result<i32> {
        Ok(self.bus.read(id, Field::PresentPosition)? as i32)
    }

    pub fn get_present_velocity(&mut self, id: u8) -> Result<i32> {
        Ok(self.bus.read(id, Field::PresentVelocity)? as i32)
    }

    pub fn is_moving(&mut self, id: u8) -> Result<bool> {
        Ok(self.bus.read(id, Field::Moving)? != 0)
    }

    /// Read every status field; any failure discards the whole read
    pub fn get_status(&mut self, id: u8) -> Result<ServoPoll> {
        let position = self.get_present_position(id)?;
        let velocity = self.get_present_velocity(id)?;
        let current = self.bus.read(id, Field::PresentCurrent)? as u16 as i16;
        let temperature = self.bus.read(id, Field::PresentTemperature)? as u8;
        // 0.1 V units
        let voltage = f64::from(self.bus.read(id, Field::PresentVoltage)? as u16) * 0.1;
        let moving = self.is_moving(id)?;
        Ok(ServoPoll {
            position,
            velocity,
            current,
            temperature,
            voltage,
            moving,
        })
    }

    /// Turn forward to `target_angle` (degrees, wrapped into [0, 360))
    pub fn move_forward_to(&mut self, id: u8, target_angle: f64, velocity: u32) -> Result<ForwardMove> {
        let target = target_angle.rem_euclid(360.0);
        let from = self.get_present_position(id)?;
        let (to, delta) = forward_goal(from, target, self.last_target);
        info!(
            "Servo {} forward move {:.1} deg -> {:.1} deg (position {} -> {}, +{:.1} deg)",
            id,
            position_to_angle(from),
            target,
            from,
            to,
            delta
        );

        self.set_profile_velocity(id, velocity)?;
        self.set_extended_goal_position(id, to)?;
        self.last_target = Some(target);
        debug!("Servo {} last target now {:.1}", id, target);
        Ok(ForwardMove { from, to, delta })
    }
}
