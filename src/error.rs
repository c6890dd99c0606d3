// Error taxonomy shared by the three device transports
//
// Transport errors mean the link is suspect and the worker reconnects.
// Frame errors mean one reply was garbage; the link stays up.

/// I/O level failures: the worker treats these as "link lost"
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for reply ({received} of {expected} bytes)")]
    Timeout { expected: usize, received: usize },

    #[error("Device {id} rejected request: code 0x{code:02X}")]
    Rejected { id: u8, code: u8 },

    #[error("Unexpected reply from device {id}: {reason}")]
    UnexpectedReply { id: u8, reason: String },

    #[error("Device {id} not found on bus")]
    NotFound { id: u8 },

    #[error("Not connected")]
    NotConnected,
}

/// A reply arrived but failed validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Checksum { computed: u16, received: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(TransportError::Io(e))
    }
}

impl From<serialport::Error> for DeviceError {
    fn from(e: serialport::Error) -> Self {
        Self::Transport(TransportError::Serial(e))
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
