// Control-table packet protocol for the multi-turn servo (v2.0 framing)
//
// Packet format: [FF FF FD 00][ID][LEN_L LEN_H][INST][PARAMS...][CRC_L CRC_H]
// LEN counts INST + PARAMS + CRC. Parameters are byte-stuffed: FF FF FD in
// the payload is sent as FF FF FD FD. CRC-16/UMTS (poly 0x8005, init 0).

use crc::{CRC_16_UMTS, Crc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeviceError, FrameError, Result, TransportError};
use crate::link::SerialLink;

/// Default serial configuration for the servo bus
pub const DEFAULT_BAUDRATE: u32 = 57_600;

pub const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];
const HEADER_LEN: usize = 7; // header + id + length
const MIN_PACKET_LEN: usize = 10;

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    Status = 0x55,
}

/// Control table fields (address, width in bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    // EEPROM area (writable only with torque off)
    ModelNumber,
    OperatingMode,

    // RAM area
    TorqueEnable,
    GoalVelocity,
    ProfileAcceleration,
    ProfileVelocity,
    GoalPosition,
    Moving,
    PresentCurrent,
    PresentVelocity,
    PresentPosition,
    PresentVoltage,
    PresentTemperature,
}

impl Field {
    pub const fn address(self) -> u16 {
        match self {
            Field::ModelNumber => 0,
            Field::OperatingMode => 11,
            Field::TorqueEnable => 64,
            Field::GoalVelocity => 104,
            Field::ProfileAcceleration => 108,
            Field::ProfileVelocity => 112,
            Field::GoalPosition => 116,
            Field::Moving => 122,
            Field::PresentCurrent => 126,
            Field::PresentVelocity => 128,
            Field::PresentPosition => 132,
            Field::PresentVoltage => 144,
            Field::PresentTemperature => 146,
        }
    }

    pub const fn width(self) -> usize {
        match self {
            Field::OperatingMode | Field::TorqueEnable | Field::Moving | Field::PresentTemperature => 1,
            Field::ModelNumber | Field::PresentCurrent | Field::PresentVoltage => 2,
            Field::GoalVelocity
            | Field::ProfileAcceleration
            | Field::ProfileVelocity
            | Field::GoalPosition
            | Field::PresentVelocity
            | Field::PresentPosition => 4,
        }
    }
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Velocity = 1,
    /// Single turn, 0..=4095
    Position = 3,
    /// Multi-turn, unbounded goal position
    ExtendedPosition = 4,
}

const PACKET_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_UMTS);

pub fn crc16(data: &[u8]) -> u16 {
    PACKET_CRC.checksum(data)
}

fn stuff(params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len() + params.len() / 3);
    for &byte in params {
        out.push(byte);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) {
            out.push(0xFD);
        }
    }
    out
}

fn unstuff(params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len());
    let mut i = 0;
    while i < params.len() {
        out.push(params[i]);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) && params.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

/// Build a full packet (instruction or status) with stuffing and CRC
pub fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let body = stuff(params);
    let length = (body.len() + 3) as u16; // instruction + params + crc
    let mut packet = Vec::with_capacity(HEADER_LEN + usize::from(length));
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.extend_from_slice(&length.to_le_bytes());
    packet.push(instruction as u8);
    packet.extend_from_slice(&body);
    let crc = crc16(&packet);
    packet.extend_from_slice(&crc.to_le_bytes());
    packet
}

/// A validated packet with its parameters unstuffed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub instruction: u8,
    pub params: Vec<u8>,
}

pub fn parse_packet(bytes: &[u8]) -> std::result::Result<Packet, FrameError> {
    if bytes.len() < MIN_PACKET_LEN {
        return Err(FrameError::Length {
            expected: MIN_PACKET_LEN,
            actual: bytes.len(),
        });
    }
    let length = usize::from(u16::from_le_bytes([bytes[5], bytes[6]]));
    if bytes.len() != HEADER_LEN + length {
        return Err(FrameError::Length {
            expected: HEADER_LEN + length,
            actual: bytes.len(),
        });
    }
    let (body, tail) = bytes.split_at(bytes.len() - 2);
    let computed = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if computed != received {
        return Err(FrameError::Checksum { computed, received });
    }
    Ok(Packet {
        id: bytes[4],
        instruction: bytes[7],
        params: unstuff(&body[8..]),
    })
}

/// Low-level servo bus: ping, read and write control-table fields
pub struct ServoBus<L: SerialLink> {
    link: L,
}

impl<L: SerialLink> ServoBus<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    /// Ping one id; `None` when nothing answers
    pub fn ping(&mut self, id: u8) -> Result<Option<u16>> {
        self.link.send(&build_packet(id, Instruction::Ping, &[]))?;
        match self.read_status(id) {
            Ok(params) if params.len() >= 2 => Ok(Some(u16::from_le_bytes([params[0], params[1]]))),
            Ok(params) => Err(TransportError::UnexpectedReply {
                id,
                reason: format!("Ping reply too short: {:02X?}", params),
            }
            .into()),
            Err(DeviceError::Transport(TransportError::Timeout { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a field as raw little-endian bits
    pub fn read(&mut self, id: u8, field: Field) -> Result<u32> {
        let width = field.width();
        let mut params = field.address().to_le_bytes().to_vec();
        params.extend_from_slice(&(width as u16).to_le_bytes());
        self.link.send(&build_packet(id, Instruction::Read, &params))?;

        let data = self.read_status(id)?;
        if data.len() != width {
            return Err(TransportError::UnexpectedReply {
                id,
                reason: format!("{:?}: expected {} bytes, got {}", field, width, data.len()),
            }
            .into());
        }
        let mut raw = [0u8; 4];
        raw[..width].copy_from_slice(&data);
        Ok(u32::from_le_bytes(raw))
    }

    /// Write the low `width` bytes of `value` to a field
    pub fn write(&mut self, id: u8, field: Field, value: u32) -> Result<()> {
        debug!("Servo {} write {:?} = {}", id, field, value);
        let mut params = field.address().to_le_bytes().to_vec();
        params.extend_from_slice(&value.to_le_bytes()[..field.width()]);
        self.link.send(&build_packet(id, Instruction::Write, &params))?;
        self.read_status(id)?;
        Ok(())
    }

    /// Read one status packet and return its data (after the error byte)
    fn read_status(&mut self, id: u8) -> Result<Vec<u8>> {
        let mut head = [0u8; HEADER_LEN];
        self.link.receive_exact(&mut head)?;
        if head[..4] != HEADER {
            return Err(TransportError::UnexpectedReply {
                id,
                reason: format!("Invalid header: {:02X?}", &head[..4]),
            }
            .into());
        }
        let length = usize::from(u16::from_le_bytes([head[5], head[6]]));
        let mut rest = vec![0u8; length];
        self.link.receive_exact(&mut rest)?;

        let packet = parse_packet(&[head.as_slice(), rest.as_slice()].concat())?;
        if packet.id != id || packet.instruction != Instruction::Status as u8 {
            return Err(TransportError::UnexpectedReply {
                id,
                reason: format!("Status from id {} instruction 0x{:02X}", packet.id, packet.instruction),
            }
            .into());
        }
        let Some((&error, data)) = packet.params.split_first() else {
            return Err(TransportError::UnexpectedReply {
                id,
                reason: "Status without error byte".to_string(),
            }
            .into());
        };
        // Bit 7 is the hardware alert flag; the rest is the error number
        if error & 0x7F != 0 {
            return Err(TransportError::Rejected { id, code: error }.into());
        }
        Ok(data.to_vec())
    }
}
