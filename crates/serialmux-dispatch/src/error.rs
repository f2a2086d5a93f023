use serialmux_frame::FrameError;

use crate::buffer::PacketBuffer;

/// Errors that can occur in dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Frame-level error relayed from the protocol engine.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// No format is registered under this id.
    #[error("unknown format id {0:#04x}")]
    UnknownFormat(u8),

    /// A packet is already being sent.
    #[error("a packet is already being sent")]
    Busy,

    /// The id is reserved and cannot be registered.
    #[error("format id {0:#04x} is reserved")]
    FormatReserved(u8),

    /// The id already has a registered format.
    #[error("format id {0:#04x} is already registered")]
    FormatInUse(u8),

    /// The length cannot be expressed in this format or does not fit the buffer.
    #[error("length {len} out of range for format {format:#04x}")]
    LengthOutOfRange { format: u8, len: usize },

    /// A buffer region is smaller than the format requires.
    #[error("buffer too small (need {required} bytes, have {available})")]
    BufferTooSmall { required: usize, available: usize },

    /// A replacement buffer does not match the receive buffer's layout.
    #[error(
        "buffer geometry mismatch (expected {expected_reserve}+{expected_capacity}, got {actual_reserve}+{actual_capacity})"
    )]
    GeometryMismatch {
        expected_reserve: usize,
        expected_capacity: usize,
        actual_reserve: usize,
        actual_capacity: usize,
    },

    /// The send queue has no slot for this client.
    #[error("unknown client {0}")]
    UnknownClient(usize),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// A send request that was refused before reaching the wire.
///
/// Carries the caller's buffer back so it is never lost.
#[derive(Debug, thiserror::Error)]
#[error("send rejected: {error}")]
pub struct Rejected {
    #[source]
    pub error: DispatchError,
    pub buffer: PacketBuffer,
}

impl Rejected {
    pub(crate) fn new(error: DispatchError, buffer: PacketBuffer) -> Self {
        Self { error, buffer }
    }

    /// Split into the error and the returned buffer.
    pub fn into_parts(self) -> (DispatchError, PacketBuffer) {
        (self.error, self.buffer)
    }
}
