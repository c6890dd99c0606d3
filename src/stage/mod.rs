// Geared rotary stage on a Modbus RTU fieldbus
//
// Provides:
// - Modbus RTU master (read holding / write single / write multiple)
// - Counts <-> degrees conversion with a movable zero reference
// - Stage driver: poll, home, move, emergency stop

mod driver;
pub mod modbus;
pub mod units;

#[cfg(test)]
pub(crate) mod sim;

pub use driver::{PathStatus, RegisterMap, StageDriver, StagePoll};
pub use modbus::{DEFAULT_BAUDRATE, ModbusBus};
pub use units::UnitConverter;
