// Modbus RTU master for the stage drive
//
// Frame format: [slave, function, data..., crc_lo, crc_hi]
// CRC-16/MODBUS (reflected poly 0xA001, init 0xFFFF), low byte first.

use crc::{CRC_16_MODBUS, Crc};
use tracing::{debug, warn};

use crate::error::{DeviceError, FrameError, Result, TransportError};
use crate::link::SerialLink;

/// Default serial configuration for the stage drive
pub const DEFAULT_BAUDRATE: u32 = 38_400;
pub const DEFAULT_RETRIES: u8 = 3;

/// Function codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

const EXCEPTION_FLAG: u8 = 0x80;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Append the CRC to a frame body
pub fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn check_crc(frame: &[u8]) -> std::result::Result<(), FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::Length {
            expected: 4,
            actual: frame.len(),
        });
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let computed = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if computed != received {
        return Err(FrameError::Checksum { computed, received });
    }
    Ok(())
}

pub fn read_request(slave: u8, address: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![slave, Function::ReadHoldingRegisters as u8];
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    seal(frame)
}

pub fn write_single_request(slave: u8, address: u16, value: u16) -> Vec<u8> {
    let mut frame = vec![slave, Function::WriteSingleRegister as u8];
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    seal(frame)
}

pub fn write_multiple_request(slave: u8, address: u16, values: &[u16]) -> Vec<u8> {
    let mut frame = vec![slave, Function::WriteMultipleRegisters as u8];
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    seal(frame)
}

/// Two registers, high word first, as a signed 32-bit value
pub fn join_i32(high: u16, low: u16) -> i32 {
    ((u32::from(high) << 16) | u32::from(low)) as i32
}

pub fn split_i32(value: i32) -> [u16; 2] {
    let raw = value as u32;
    [(raw >> 16) as u16, (raw & 0xFFFF) as u16]
}

/// Modbus RTU master bound to one slave address
pub struct ModbusBus<L: SerialLink> {
    link: L,
    slave: u8,
    retries: u8,
}

impl<L: SerialLink> ModbusBus<L> {
    pub fn new(link: L, slave: u8) -> Self {
        Self::with_retries(link, slave, DEFAULT_RETRIES)
    }

    /// Timeouts are retried `retries` extra times before surfacing
    pub fn with_retries(link: L, slave: u8, retries: u8) -> Self {
        Self {
            link,
            slave,
            retries,
        }
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Read `count` consecutive holding registers
    pub fn read_holding(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let request = read_request(self.slave, address, count);
        let payload = self.transact(&request)?;

        // payload: [byte_count, data...]
        let expected = usize::from(count) * 2;
        if payload.first().map(|&n| usize::from(n)) != Some(expected) || payload.len() != expected + 1 {
            return Err(self.unexpected(format!(
                "Expected {} data bytes, got {:02X?}",
                expected, payload
            )));
        }
        Ok(payload[1..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        debug!("Write reg 0x{:04X} = 0x{:04X}", address, value);
        let request = write_single_request(self.slave, address, value);
        let payload = self.transact(&request)?;
        if payload != request[2..6] {
            return Err(self.unexpected(format!("Write echo mismatch: {:02X?}", payload)));
        }
        Ok(())
    }

    pub fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        debug!("Write regs 0x{:04X} = {:04X?}", address, values);
        let request = write_multiple_request(self.slave, address, values);
        let payload = self.transact(&request)?;
        if payload != request[2..6] {
            return Err(self.unexpected(format!("Write echo mismatch: {:02X?}", payload)));
        }
        Ok(())
    }

    fn unexpected(&self, reason: String) -> DeviceError {
        TransportError::UnexpectedReply {
            id: self.slave,
            reason,
        }
        .into()
    }

    /// Send a request and return the reply payload (between function code and CRC)
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.transact_once(request) {
                Err(DeviceError::Transport(TransportError::Timeout { .. })) if attempt < self.retries => {
                    attempt += 1;
                    warn!("Modbus timeout from slave {}, retry {}/{}", self.slave, attempt, self.retries);
                    self.link.discard_input()?;
                }
                other => return other,
            }
        }
    }

    fn transact_once(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.link.send(request)?;

        let mut header = [0u8; 2];
        self.link.receive_exact(&mut header)?;
        let [slave, function] = header;
        if slave != self.slave {
            return Err(self.unexpected(format!("Reply from slave {}", slave)));
        }

        let requested = request[1];
        if function == requested | EXCEPTION_FLAG {
            let mut rest = [0u8; 3];
            self.link.receive_exact(&mut rest)?;
            check_crc(&[header.as_slice(), rest.as_slice()].concat())?;
            return Err(TransportError::Rejected {
                id: self.slave,
                code: rest[0],
            }
            .into());
        }
        if function != requested {
            return Err(self.unexpected(format!("Function 0x{:02X} in reply", function)));
        }

        let mut frame = header.to_vec();
        if function == Function::ReadHoldingRegisters as u8 {
            let mut count = [0u8; 1];
            self.link.receive_exact(&mut count)?;
            frame.push(count[0]);
            let mut rest = vec![0u8; usize::from(count[0]) + 2];
            self.link.receive_exact(&mut rest)?;
            frame.extend_from_slice(&rest);
        } else {
            // address + value/quantity echo
            let mut rest = [0u8; 6];
            self.link.receive_exact(&mut rest)?;
            frame.extend_from_slice(&rest);
        }
        check_crc(&frame)?;

        Ok(frame[2..frame.len() - 2].to_vec())
    }
}
