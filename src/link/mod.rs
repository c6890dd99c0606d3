// Byte-level link shared by all three device protocols
//
// Drivers are generic over `SerialLink` so the protocol code can be
// exercised against a scripted mock instead of a real port.

use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;

#[cfg(test)]
pub(crate) mod mock;

/// A half-duplex byte pipe with a read timeout
pub trait SerialLink: Send {
    /// Write all bytes and flush
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, returning early when the read timeout expires
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Drop anything sitting in the input buffer
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes or fail with a timeout
    fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let received = self.receive(buf)?;
        if received < buf.len() {
            return Err(TransportError::Timeout {
                expected: buf.len(),
                received,
            });
        }
        Ok(())
    }
}

impl<L: SerialLink + ?Sized> SerialLink for Box<L> {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).receive(buf)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        (**self).discard_input()
    }
}

/// Serial port settings for one device
#[derive(Debug, Clone)]
pub struct PortSettings {
    pub path: String,
    pub baud_rate: u32,
    pub timeout: Duration,
}

/// `SerialLink` over an OS serial port (8N1)
pub struct PortLink {
    port: Box<dyn SerialPort>,
}

impl PortLink {
    pub fn open(settings: &PortSettings) -> Result<Self, TransportError> {
        debug!(
            "Opening {} at {} baud (timeout {:?})",
            settings.path, settings.baud_rate, settings.timeout
        );
        let port = serialport::new(&settings.path, settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(settings.timeout)
            .open()?;
        Ok(Self { port })
    }
}

impl SerialLink for PortLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Names of the serial ports the OS currently reports
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}
