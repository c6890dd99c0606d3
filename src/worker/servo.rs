// Servo device: discovery on connect, direct commands, status reads

use std::ops::RangeInclusive;
use tracing::info;

use super::{Connector, Device};
use crate::config::ServoConfig;
use crate::error::{Result, TransportError};
use crate::link::SerialLink;
use crate::messages::{ServoCommand, ServoReading};
use crate::servo::{OperatingMode, ServoBus, ServoDriver, position_to_angle};

pub struct ServoDevice {
    connector: Connector,
    driver: Option<ServoDriver<Box<dyn SerialLink>>>,
    motor_id: u8,
    scan: RangeInclusive<u8>,
    mode: OperatingMode,
    profile_velocity: u32,
    profile_acceleration: u32,
}

impl ServoDevice {
    pub fn new(config: &ServoConfig, connector: Connector) -> Self {
        Self {
            connector,
            driver: None,
            motor_id: config.motor_id,
            scan: config.scan_first..=config.scan_last,
            mode: config.operating_mode,
            profile_velocity: config.profile_velocity,
            profile_acceleration: config.profile_acceleration,
        }
    }

    fn apply(&mut self, driver: &mut ServoDriver<Box<dyn SerialLink>>, command: ServoCommand) -> Result<()> {
        let id = self.motor_id;
        info!("Servo command: {:?}", command);
        match command {
            ServoCommand::MoveForward { degrees, velocity } => {
                driver.move_forward_to(id, degrees, velocity.unwrap_or(self.profile_velocity))?;
            }
            ServoCommand::GoalPosition { position } => match self.mode {
                OperatingMode::ExtendedPosition => driver.set_extended_goal_position(id, position)?,
                _ => driver.set_goal_position(id, position)?,
            },
            ServoCommand::GoalVelocity { velocity } => driver.set_goal_velocity(id, velocity)?,
            ServoCommand::TorqueOn => driver.enable_torque(id)?,
            ServoCommand::TorqueOff => driver.disable_torque(id)?,
            ServoCommand::Stop => driver.stop(id)?,
            ServoCommand::SetOperatingMode { mode } => {
                driver.change_operating_mode(id, mode)?;
                self.mode = mode;
            }
            ServoCommand::SetProfile { velocity, acceleration } => {
                driver.set_profile_velocity(id, velocity)?;
                driver.set_profile_acceleration(id, acceleration)?;
                self.profile_velocity = velocity;
                self.profile_acceleration = acceleration;
            }
        }
        Ok(())
    }

    fn exchange(&mut self, driver: &mut ServoDriver<Box<dyn SerialLink>>, commands: Vec<ServoCommand>) -> Result<ServoReading> {
        for command in commands {
            self.apply(driver, command)?;
        }
        let status = driver.get_status(self.motor_id)?;
        Ok(ServoReading {
            motor_id: self.motor_id,
            position: status.position,
            angle: position_to_angle(status.position),
            velocity: status.velocity,
            current: status.current,
            temperature: status.temperature,
            voltage: status.voltage,
            moving: status.moving,
        })
    }
}

impl Device for ServoDevice {
    type Command = ServoCommand;
    type Reading = ServoReading;

    fn name(&self) -> &str {
        "servo"
    }

    fn is_connected(&self) -> bool {
        self.driver.is_some()
    }

    fn connect(&mut self) -> Result<()> {
        let link = (self.connector)()?;
        let mut driver = ServoDriver::new(ServoBus::new(link));

        let found = driver.scan(self.scan.clone())?;
        if !found.iter().any(|(id, _)| *id == self.motor_id) {
            return Err(TransportError::NotFound { id: self.motor_id }.into());
        }

        driver.change_operating_mode(self.motor_id, self.mode)?;
        driver.set_profile_velocity(self.motor_id, self.profile_velocity)?;
        driver.set_profile_acceleration(self.motor_id, self.profile_acceleration)?;
        self.driver = Some(driver);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.driver.take().is_some() {
            info!("Servo disconnected");
        }
    }

    fn tick(&mut self, commands: Vec<ServoCommand>) -> Result<ServoReading> {
        let mut driver = self.driver.take().ok_or(TransportError::NotConnected)?;
        let result = self.exchange(&mut driver, commands);
        self.driver = Some(driver);
        result
    }
}
