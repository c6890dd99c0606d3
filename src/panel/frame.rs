// Fixed 8-byte frames for the indicator panel
//
// Request:  [signal][6 payload bytes][crc8]
// Response: [digital_output][6 payload bytes][crc8]
// CRC-8, polynomial 0x07, init 0, over the first 7 bytes.

use crc::{CRC_8_SMBUS, Crc};

use crate::error::FrameError;

pub const FRAME_LEN: usize = 8;
pub const PAYLOAD_LEN: usize = 6;

// CRC-8/SMBUS: polynomial 0x07, init 0
const PANEL_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-8 over every byte except the trailing checksum slot
pub fn checksum(frame: &[u8]) -> u8 {
    let Some((_, body)) = frame.split_last() else {
        return 0;
    };
    crc8(body)
}

/// Compare the trailing byte against the checksum of the rest
pub fn verify(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((&received, body)) => crc8(body) == received,
        None => false,
    }
}

fn crc8(data: &[u8]) -> u8 {
    PANEL_CRC.checksum(data)
}

/// Append a checksum slot to `body` and fill it
pub fn seal(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.extend_from_slice(body);
    frame.push(crc8(body));
    frame
}

pub fn encode_request(signal: u8, payload: [u8; PAYLOAD_LEN]) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = signal;
    frame[1..FRAME_LEN - 1].copy_from_slice(&payload);
    frame[FRAME_LEN - 1] = checksum(&frame);
    frame
}

/// Decoded panel reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelResponse {
    pub digital_output: u8,
    pub payload: [u8; PAYLOAD_LEN],
    /// Last payload byte again; the panel packs its switch inputs there
    pub switch_bits: u8,
}

pub fn decode_response(bytes: &[u8]) -> Result<PanelResponse, FrameError> {
    if bytes.len() != FRAME_LEN {
        return Err(FrameError::Length {
            expected: FRAME_LEN,
            actual: bytes.len(),
        });
    }
    let computed = checksum(bytes);
    let received = bytes[FRAME_LEN - 1];
    if computed != received {
        return Err(FrameError::Checksum {
            computed: computed.into(),
            received: received.into(),
        });
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&bytes[1..FRAME_LEN - 1]);
    Ok(PanelResponse {
        digital_output: bytes[0],
        payload,
        switch_bits: payload[PAYLOAD_LEN - 1],
    })
}

/// Switch 1 is wired to bit 7
pub fn switch_one(switch_bits: u8) -> bool {
    switch_bits & 0x80 != 0
}

/// Switch 2 reads the whole high nibble
pub fn switch_two(switch_bits: u8) -> bool {
    switch_bits & 0xF0 != 0
}
