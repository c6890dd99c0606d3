// Panel device: commanded signal/brightness and one exchange per tick

use tracing::{info, warn};

use super::{Connector, Device};
use crate::config::PanelConfig;
use crate::error::{Result, TransportError};
use crate::link::SerialLink;
use crate::messages::{PanelCommand, PanelReading};
use crate::panel::frame::{switch_one, switch_two};
use crate::panel::{PAYLOAD_LEN, PanelBus};

pub struct PanelDevice {
    connector: Connector,
    bus: Option<PanelBus<Box<dyn SerialLink>>>,
    signal: u8,
    brightness: [u8; PAYLOAD_LEN],
}

impl PanelDevice {
    pub fn new(config: &PanelConfig, connector: Connector) -> Self {
        Self {
            connector,
            bus: None,
            signal: config.signal,
            brightness: config.brightness,
        }
    }

    fn apply(&mut self, command: PanelCommand) {
        match command {
            PanelCommand::SetSignal { signal } => {
                info!("Panel signal -> {}", signal);
                self.signal = signal;
            }
            PanelCommand::SetBrightness { values } => {
                info!("Panel brightness -> {:?}", values);
                self.brightness = values;
            }
            PanelCommand::SetLed { index, value } => match self.brightness.get_mut(index) {
                Some(slot) => *slot = value,
                None => warn!("LED index {} out of range (0..{})", index, PAYLOAD_LEN),
            },
            PanelCommand::SetAll { value } => self.brightness = [value; PAYLOAD_LEN],
        }
    }
}

impl Device for PanelDevice {
    type Command = PanelCommand;
    type Reading = PanelReading;

    fn name(&self) -> &str {
        "panel"
    }

    fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    fn connect(&mut self) -> Result<()> {
        let link = (self.connector)()?;
        self.bus = Some(PanelBus::new(link));
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.bus.take().is_some() {
            info!("Panel disconnected");
        }
    }

    fn tick(&mut self, commands: Vec<PanelCommand>) -> Result<PanelReading> {
        for command in commands {
            self.apply(command);
        }
        let bus = self.bus.as_mut().ok_or(TransportError::NotConnected)?;
        let response = bus.exchange(self.signal, self.brightness)?;
        Ok(PanelReading {
            signal: self.signal,
            digital_output: response.digital_output,
            brightness: response.payload,
            switch_bits: response.switch_bits,
            switch_one: switch_one(response.switch_bits),
            switch_two: switch_two(response.switch_bits),
        })
    }
}
