// Multi-turn servo on a control-table packet bus
//
// Provides:
// - Packet framing (v2.0 header, byte stuffing, CRC-16)
// - Control-table reads/writes and ping discovery
// - Forward-only multi-turn positioning

mod driver;
pub mod protocol;

#[cfg(test)]
pub(crate) mod sim;

pub use driver::{ForwardMove, RESOLUTION, ServoDriver, ServoPoll, forward_delta, position_to_angle};
pub use protocol::{DEFAULT_BAUDRATE, OperatingMode, ServoBus};
