// Request/response exchange with the indicator panel

use tracing::{debug, warn};

use super::frame::{FRAME_LEN, PAYLOAD_LEN, PanelResponse, decode_response, encode_request};
use crate::error::Result;
use crate::link::SerialLink;

/// Default serial configuration for the panel controller
pub const DEFAULT_BAUDRATE: u32 = 115_200;

pub struct PanelBus<L: SerialLink> {
    link: L,
}

impl<L: SerialLink> PanelBus<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    /// Send one request frame and read back exactly one reply frame
    ///
    /// A short or corrupt reply is a frame error. Leftover input is dropped
    /// so the next exchange starts on a frame boundary.
    pub fn exchange(&mut self, signal: u8, payload: [u8; PAYLOAD_LEN]) -> Result<PanelResponse> {
        let request = encode_request(signal, payload);
        debug!("Panel request: {:02X?}", request);
        self.link.send(&request)?;

        let mut reply = [0u8; FRAME_LEN];
        let received = self.link.receive(&mut reply)?;
        let response = match decode_response(&reply[..received]) {
            Ok(response) => response,
            Err(e) => {
                warn!("Panel reply rejected ({}), flushing input", e);
                self.link.discard_input()?;
                return Err(e.into());
            }
        };
        debug!(
            "Panel reply: output={} payload={:?} switches={:#010b}",
            response.digital_output, response.payload, response.switch_bits
        );
        Ok(response)
    }
}
