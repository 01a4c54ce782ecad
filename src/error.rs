/// Recoverable framing problems reported by the [`FrameDecoder`](crate::protocol::FrameDecoder).
///
/// None of these is fatal: the decoder has already resynchronized by the time one is returned, so
/// callers only log and count them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("address mismatch - expected={expected:#04x} received={received:#04x}")]
    AddressMismatch { expected: u8, received: u8 },
    #[error("unexpected function code {0:#04x}")]
    UnexpectedFunction(u8),
    #[error("invalid checksum - calculated={calculated:#06x} received={received:#06x}")]
    CrcMismatch { calculated: u16, received: u16 },
    #[error("payload length {0} is not a whole number of registers")]
    OddPayloadLength(u8),
    /// A header announced a frame of this many bytes, more than the receive buffer holds.
    #[error("receive buffer overflow, announced frame of {0} bytes does not fit")]
    BufferOverflow(usize),
}

/// Errors surfaced by the device session and the clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial connection could not be (re)opened, or the session is not open.
    #[error("Connection error: {0}")]
    Connection(String),
    /// A read/decode cycle failed for a reason other than framing.
    #[error("Acquisition error: {0}")]
    Acquisition(String),
    /// Too many consecutive acquisition failures, the session closed itself.
    #[error("Device faulted after {consecutive_errors} consecutive errors")]
    Fault { consecutive_errors: u32 },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
