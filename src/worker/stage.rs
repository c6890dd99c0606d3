// Stage device: direct commands, the looping schedule and status polling

use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

use super::{Connector, Device};
use crate::config::{OffsetStore, StageConfig};
use crate::error::{Result, TransportError};
use crate::link::SerialLink;
use crate::messages::{MoveParams, StageCommand, StageReading};
use crate::schedule::{Action, Command, Scheduler};
use crate::stage::{ModbusBus, RegisterMap, StageDriver, StagePoll, UnitConverter};

type Driver = StageDriver<Box<dyn SerialLink>>;

pub struct StageDevice {
    connector: Connector,
    driver: Option<Driver>,
    slave_id: u8,
    retries: u8,
    units: UnitConverter,
    scheduler: Scheduler,
    clock: Instant,
    zero_offset: i32,
    offset_store: Option<OffsetStore>,
    presets: BTreeMap<String, f64>,
    default_velocity: u16,
    default_acceleration: u16,
    last_poll: Option<StagePoll>,
}

impl StageDevice {
    /// `zero_offset` is the value loaded from the offset store
    pub fn new(config: &StageConfig, schedule: Vec<Command>, zero_offset: i32, connector: Connector) -> Self {
        Self {
            connector,
            driver: None,
            slave_id: config.slave_id,
            retries: config.retries,
            units: config.units(),
            scheduler: Scheduler::new(schedule),
            clock: Instant::now(),
            zero_offset,
            offset_store: None,
            presets: config.presets.clone(),
            default_velocity: config.default_velocity,
            default_acceleration: config.default_acceleration,
            last_poll: None,
        }
    }

    /// Where `SaveZeroOffset` writes the current offset
    pub fn with_offset_store(mut self, store: OffsetStore) -> Self {
        self.offset_store = Some(store);
        self
    }

    fn save_zero_offset(&self) {
        match &self.offset_store {
            Some(store) => {
                if let Err(e) = store.save(self.zero_offset) {
                    warn!("Offset not saved: {}", e);
                }
            }
            None => warn!("Offset save requested but no offset file is configured"),
        }
    }

    fn default_move(&self, target_deg: f64) -> MoveParams {
        MoveParams {
            target_deg,
            velocity: self.default_velocity,
            acceleration: self.default_acceleration,
            dwell: 0,
        }
    }

    /// Last verified position in degrees
    fn current_degrees(&self) -> Option<f64> {
        self.last_poll
            .map(|poll| self.units.counts_to_degrees(poll.position, self.zero_offset))
    }

    fn apply(&mut self, driver: &mut Driver, command: StageCommand, now: f64) -> Result<()> {
        info!("Stage command: {:?}", command);
        match command {
            StageCommand::Move(params) => {
                self.scheduler.stop_loop();
                driver.move_to(&params, self.zero_offset)?;
            }
            StageCommand::GoTo { degrees } => {
                self.scheduler.stop_loop();
                driver.move_to(&self.default_move(degrees), self.zero_offset)?;
            }
            StageCommand::Jog { degrees } => {
                let Some(current) = self.current_degrees() else {
                    warn!("Jog ignored: no verified position yet");
                    return Ok(());
                };
                self.scheduler.stop_loop();
                driver.move_to(&self.default_move(current + degrees), self.zero_offset)?;
            }
            StageCommand::Preset { name } => {
                let Some(&degrees) = self.presets.get(&name) else {
                    warn!("Unknown preset '{}'", name);
                    return Ok(());
                };
                self.scheduler.stop_loop();
                driver.move_to(&self.default_move(degrees), self.zero_offset)?;
            }
            StageCommand::Home => driver.home()?,
            StageCommand::EStop => {
                self.scheduler.stop_loop();
                driver.estop()?;
            }
            StageCommand::StartLoop => self.scheduler.start_loop(now),
            StageCommand::StopLoop => self.scheduler.stop_loop(),
            StageCommand::SetZeroOffset { counts } => {
                info!("Zero offset {} -> {}", self.zero_offset, counts);
                self.zero_offset = counts;
            }
            StageCommand::SaveZeroOffset => self.save_zero_offset(),
        }
        Ok(())
    }

    fn dispatch(&self, driver: &mut Driver, command: &Command) -> Result<()> {
        match command.action {
            Action::Move(params) => {
                info!(
                    "Scheduled MOVE at {:.2}s: {:+.3} deg, vel={} acc={} dwell={}",
                    command.time, params.target_deg, params.velocity, params.acceleration, params.dwell
                );
                driver.move_to(&params, self.zero_offset)?;
            }
            Action::Home => {
                info!("Scheduled HOME at {:.2}s", command.time);
                driver.home()?;
            }
            Action::EStop => {
                info!("Scheduled ESTOP at {:.2}s", command.time);
                driver.estop()?;
            }
            // Consumed by the scheduler
            Action::Restart => {}
        }
        Ok(())
    }

    /// One tick at schedule time `now` (seconds on the device clock)
    fn tick_at(&mut self, commands: Vec<StageCommand>, now: f64) -> Result<StageReading> {
        let mut driver = self.driver.take().ok_or(TransportError::NotConnected)?;
        let result = self.exchange(&mut driver, commands, now);
        self.driver = Some(driver);
        result
    }

    fn exchange(&mut self, driver: &mut Driver, commands: Vec<StageCommand>, now: f64) -> Result<StageReading> {
        for command in commands {
            self.apply(driver, command, now)?;
        }
        for command in self.scheduler.poll(now) {
            self.dispatch(driver, &command)?;
        }

        let poll = driver.poll()?;
        self.last_poll = Some(poll);
        Ok(StageReading {
            position: poll.position,
            degrees: self.units.counts_to_degrees(poll.position, self.zero_offset),
            velocity: poll.velocity,
            velocity_deg_s: self
                .units
                .counts_per_sec_to_degrees_per_sec(f64::from(poll.velocity)),
            torque: poll.torque,
            ready: poll.ready,
            running: poll.running,
            faulted: poll.faulted,
            homed: poll.homed,
            zero_offset: self.zero_offset,
            looping: self.scheduler.is_looping(),
            cycle_index: self.scheduler.cycle_index(),
        })
    }
}

impl Device for StageDevice {
    type Command = StageCommand;
    type Reading = StageReading;

    fn name(&self) -> &str {
        "stage"
    }

    fn is_connected(&self) -> bool {
        self.driver.is_some()
    }

    fn connect(&mut self) -> Result<()> {
        let link = (self.connector)()?;
        let bus = ModbusBus::with_retries(link, self.slave_id, self.retries);
        let mut driver = StageDriver::new(bus, RegisterMap::DEFAULT, self.units);
        driver.clear_alarm()?;
        self.driver = Some(driver);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.driver.take().is_some() {
            info!("Stage disconnected");
        }
    }

    fn tick(&mut self, commands: Vec<StageCommand>) -> Result<StageReading> {
        let now = self.clock.elapsed().as_secs_f64();
        self.tick_at(commands, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RigConfig;
    use crate::error::DeviceError;
    use crate::schedule::parse_schedule;
    use crate::stage::sim::FakeDrive;

    const TRIGGER: u16 = 0x6002;

    fn config() -> StageConfig {
        RigConfig::from_toml_str(
            "[stage]\nport = \"sim\"\nbaud_rate = 38400\nslave_id = 1\npresets = { load = 10.0 }\n",
        )
        .unwrap()
        .stage
        .unwrap()
    }

    fn device(drive: &FakeDrive, schedule: &str) -> StageDevice {
        let drive = drive.clone();
        let connector: Connector = Box::new(move || Ok(Box::new(drive.link()) as Box<dyn SerialLink>));
        let mut device = StageDevice::new(&config(), parse_schedule(schedule).unwrap(), 0, connector);
        device.connect().unwrap();
        device
    }

    fn target_counts(drive: &FakeDrive) -> i32 {
        crate::stage::modbus::join_i32(drive.register(0x6209), drive.register(0x620A))
    }

    #[test]
    fn test_connect_clears_alarm() {
        let drive = FakeDrive::new(1);
        let _device = device(&drive, "");
        assert_eq!(drive.writes(), vec![(0x1801, 0x1111)]);
    }

    #[test]
    fn test_reading_converts_units() {
        let drive = FakeDrive::new(1);
        drive.set_register(0x0B05, 0b1001);
        drive.set_register(0x0B06, 3889);
        drive.set_position(3889 + 100);
        let mut device = device(&drive, "");

        device.tick_at(vec![StageCommand::SetZeroOffset { counts: 100 }], 0.0).unwrap();
        let reading = device.tick_at(vec![], 0.1).unwrap();
        assert!(reading.ready && reading.homed && !reading.running);
        assert_eq!(reading.zero_offset, 100);
        assert!((reading.degrees - 2.0).abs() < 1e-3);
        assert!((reading.velocity_deg_s - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_loop_dispatches_schedule() {
        let drive = FakeDrive::new(1);
        let mut device = device(&drive, "0.0,MOVE,+2.0,10,100,0\n5.0,MOVE,-2.0,10,100,0");

        device.tick_at(vec![StageCommand::StartLoop], 0.0).unwrap();
        assert_eq!(target_counts(&drive), 3889);
        assert_eq!(drive.register(TRIGGER), 0x0011);

        drive.clear_writes();
        let reading = device.tick_at(vec![], 2.0).unwrap();
        assert!(drive.writes().is_empty());
        assert!(reading.looping);

        device.tick_at(vec![], 5.01).unwrap();
        assert_eq!(target_counts(&drive), 3889);
        let moves: Vec<_> = drive.writes().into_iter().filter(|w| w.0 == 0x620A).collect();
        assert_eq!(moves.len(), 2);
    }

    #[test]
    fn test_direct_motion_stops_loop_but_home_does_not() {
        let drive = FakeDrive::new(1);
        let mut device = device(&drive, "0.0,MOVE,+2.0,10,100,0\n5.0,MOVE,-2.0,10,100,0");

        device.tick_at(vec![StageCommand::StartLoop, StageCommand::Home], 0.0).unwrap();
        assert!(device.scheduler.is_looping());

        let reading = device.tick_at(vec![StageCommand::GoTo { degrees: 0.0 }], 1.0).unwrap();
        assert!(!reading.looping);
        assert_eq!(target_counts(&drive), 0);

        device.tick_at(vec![StageCommand::StartLoop, StageCommand::EStop], 2.0).unwrap();
        assert!(!device.scheduler.is_looping());
        assert_eq!(drive.register(TRIGGER), 0x0040);
    }

    #[test]
    fn test_jog_and_preset() {
        let drive = FakeDrive::new(1);
        drive.set_position(3889);
        let mut device = device(&drive, "");

        // No verified position yet: jog is dropped
        device.tick_at(vec![StageCommand::Jog { degrees: 0.1 }], 0.0).unwrap();
        assert_eq!(target_counts(&drive), 0);

        device.tick_at(vec![StageCommand::Jog { degrees: -1.0 }], 0.1).unwrap();
        assert_eq!(target_counts(&drive), 1945);
        assert_eq!(drive.register(0x620B), 2);
        assert_eq!(drive.register(0x620C), 100);

        device
            .tick_at(vec![StageCommand::Preset { name: "nowhere".into() }], 0.2)
            .unwrap();
        device
            .tick_at(vec![StageCommand::Preset { name: "load".into() }], 0.3)
            .unwrap();
        assert_eq!(target_counts(&drive), 19444);
    }

    #[test]
    fn test_save_uses_offset_set_before_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::new(dir.path().join("offset.json"));
        let drive = FakeDrive::new(1);
        let mut device = device(&drive, "").with_offset_store(store.clone());

        device
            .tick_at(
                vec![
                    StageCommand::SetZeroOffset { counts: 250 },
                    StageCommand::SaveZeroOffset,
                    StageCommand::SetZeroOffset { counts: 300 },
                ],
                0.0,
            )
            .unwrap();
        assert_eq!(store.load_or(0), 250);

        device.tick_at(vec![StageCommand::SaveZeroOffset], 0.1).unwrap();
        assert_eq!(store.load_or(0), 300);
    }

    #[test]
    fn test_save_waits_for_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let store = OffsetStore::new(dir.path().join("offset.json"));
        let drive = FakeDrive::new(1);
        let mut device = device(&drive, "").with_offset_store(store.clone());
        device.disconnect();

        let queued = vec![StageCommand::SetZeroOffset { counts: -40 }, StageCommand::SaveZeroOffset];
        assert!(device.tick_at(queued.clone(), 0.0).is_err());
        assert_eq!(store.load_or(0), 0);

        device.connect().unwrap();
        device.tick_at(queued, 0.1).unwrap();
        assert_eq!(store.load_or(0), -40);
    }

    #[test]
    fn test_rejected_write_is_transport_error() {
        let drive = FakeDrive::new(1);
        let mut device = device(&drive, "");
        drive.reject_next(0x04);
        let err = device.tick_at(vec![StageCommand::Home], 0.0).unwrap_err();
        assert!(matches!(err, DeviceError::Transport(TransportError::Rejected { .. })));
        assert!(device.is_connected());

        device.disconnect();
        let err = device.tick_at(vec![], 0.1).unwrap_err();
        assert!(matches!(err, DeviceError::Transport(TransportError::NotConnected)));
    }
}
