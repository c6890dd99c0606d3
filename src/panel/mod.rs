// Indicator/LED panel on a custom framed serial link
//
// Provides:
// - CRC-8 frame codec
// - Panel request/response exchange

mod driver;
pub mod frame;

pub use driver::{DEFAULT_BAUDRATE, PanelBus};
pub use frame::{FRAME_LEN, PAYLOAD_LEN, PanelResponse};
