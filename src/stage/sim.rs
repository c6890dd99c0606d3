// Simulated Modbus drive for tests: a register map behind a MockLink

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::modbus::{Function, seal, split_i32};
use crate::link::mock::MockLink;

#[derive(Clone)]
pub(crate) struct FakeDrive {
    state: Arc<Mutex<FakeDriveState>>,
}

struct FakeDriveState {
    slave: u8,
    registers: HashMap<u16, u16>,
    writes: Vec<(u16, u16)>,
    reject: Option<u8>,
    corrupt: bool,
}

impl FakeDrive {
    pub(crate) fn new(slave: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeDriveState {
                slave,
                registers: HashMap::new(),
                writes: Vec::new(),
                reject: None,
                corrupt: false,
            })),
        }
    }

    /// A fresh link wired to this drive
    pub(crate) fn link(&self) -> MockLink {
        let drive = self.clone();
        MockLink::with_responder(move |frame| drive.respond(frame))
    }

    pub(crate) fn set_register(&self, address: u16, value: u16) {
        self.state.lock().unwrap().registers.insert(address, value);
    }

    pub(crate) fn set_position(&self, counts: i32) {
        let [high, low] = split_i32(counts);
        self.set_register(0x602C, high);
        self.set_register(0x602D, low);
    }

    pub(crate) fn register(&self, address: u16) -> u16 {
        self.state
            .lock()
            .unwrap()
            .registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Every register written, in order (multi-register writes expanded)
    pub(crate) fn writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub(crate) fn reject_next(&self, code: u8) {
        self.state.lock().unwrap().reject = Some(code);
    }

    pub(crate) fn corrupt_next(&self) {
        self.state.lock().unwrap().corrupt = true;
    }

    fn respond(&self, frame: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        let slave = state.slave;
        let function = frame[1];
        let address = u16::from_be_bytes([frame[2], frame[3]]);

        if let Some(code) = state.reject.take() {
            return seal(vec![slave, function | 0x80, code]);
        }

        let mut reply = vec![slave, function];
        match function {
            f if f == Function::ReadHoldingRegisters as u8 => {
                let count = u16::from_be_bytes([frame[4], frame[5]]);
                reply.push((count * 2) as u8);
                for offset in 0..count {
                    let value = state.registers.get(&(address + offset)).copied().unwrap_or(0);
                    reply.extend_from_slice(&value.to_be_bytes());
                }
            }
            f if f == Function::WriteSingleRegister as u8 => {
                let value = u16::from_be_bytes([frame[4], frame[5]]);
                state.registers.insert(address, value);
                state.writes.push((address, value));
                reply.extend_from_slice(&frame[2..6]);
            }
            f if f == Function::WriteMultipleRegisters as u8 => {
                let count = u16::from_be_bytes([frame[4], frame[5]]);
                for offset in 0..count {
                    let at = 7 + usize::from(offset) * 2;
                    let value = u16::from_be_bytes([frame[at], frame[at + 1]]);
                    state.registers.insert(address + offset, value);
                    state.writes.push((address + offset, value));
                }
                reply.extend_from_slice(&frame[2..6]);
            }
            _ => return seal(vec![slave, function | 0x80, 0x01]),
        }

        let mut sealed = seal(reply);
        if std::mem::take(&mut state.corrupt) {
            let last = sealed.len() - 1;
            sealed[last] ^= 0xFF;
        }
        sealed
    }
}
