// Simulated servo for tests: a control table behind a MockLink
//
// Goal position writes move the present position instantly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::protocol::{Field, Instruction, build_packet, parse_packet};
use crate::link::mock::MockLink;

#[derive(Clone)]
pub(crate) struct FakeServo {
    state: Arc<Mutex<FakeServoState>>,
}

struct FakeServoState {
    id: u8,
    model: u16,
    table: HashMap<u16, u8>,
    error: Option<u8>,
    silent: bool,
}

impl FakeServo {
    pub(crate) fn new(id: u8, model: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeServoState {
                id,
                model,
                table: HashMap::new(),
                error: None,
                silent: false,
            })),
        }
    }

    pub(crate) fn link(&self) -> MockLink {
        let servo = self.clone();
        MockLink::with_responder(move |frame| servo.respond(frame))
    }

    pub(crate) fn set_field(&self, field: Field, value: u32) {
        let mut state = self.state.lock().unwrap();
        let address = field.address();
        for (i, byte) in value.to_le_bytes()[..field.width()].iter().enumerate() {
            state.table.insert(address + i as u16, *byte);
        }
    }

    pub(crate) fn field(&self, field: Field) -> u32 {
        let state = self.state.lock().unwrap();
        let mut raw = [0u8; 4];
        for (i, slot) in raw[..field.width()].iter_mut().enumerate() {
            *slot = state.table.get(&(field.address() + i as u16)).copied().unwrap_or(0);
        }
        u32::from_le_bytes(raw)
    }

    pub(crate) fn error_next(&self, code: u8) {
        self.state.lock().unwrap().error = Some(code);
    }

    /// Stop answering (every request times out)
    pub(crate) fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    fn respond(&self, frame: &[u8]) -> Vec<u8> {
        let Ok(packet) = parse_packet(frame) else {
            return Vec::new();
        };
        let mut state = self.state.lock().unwrap();
        if state.silent || packet.id != state.id {
            return Vec::new();
        }
        let id = state.id;
        if let Some(code) = state.error.take() {
            return build_packet(id, Instruction::Status, &[code]);
        }

        let mut reply = vec![0u8];
        match packet.instruction {
            i if i == Instruction::Ping as u8 => {
                reply.extend_from_slice(&state.model.to_le_bytes());
                reply.push(0x2E);
            }
            i if i == Instruction::Read as u8 => {
                let address = u16::from_le_bytes([packet.params[0], packet.params[1]]);
                let width = u16::from_le_bytes([packet.params[2], packet.params[3]]);
                for offset in 0..width {
                    reply.push(state.table.get(&(address + offset)).copied().unwrap_or(0));
                }
            }
            i if i == Instruction::Write as u8 => {
                let address = u16::from_le_bytes([packet.params[0], packet.params[1]]);
                for (i, byte) in packet.params[2..].iter().enumerate() {
                    state.table.insert(address + i as u16, *byte);
                }
                if address == Field::GoalPosition.address() {
                    let goal = &packet.params[2..6];
                    for (i, byte) in goal.iter().enumerate() {
                        state.table.insert(Field::PresentPosition.address() + i as u16, *byte);
                    }
                }
            }
            _ => reply[0] = 0x02,
        }
        build_packet(id, Instruction::Status, &reply)
    }
}
