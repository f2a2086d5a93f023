use serialmux_transport::TransportError;

/// Errors reported through frame send/receive completions.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The transport failed while a byte of this frame was being sent.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A delimiter arrived before the frame was complete.
    #[error("loss of sync (premature delimiter)")]
    LossOfSync,

    /// The frame was complete but its checksum did not match.
    #[error("crc mismatch (expected {expected:#06x}, received {actual:#06x})")]
    Crc { expected: u16, actual: u16 },

    /// No acknowledgment arrived after all retransmissions.
    #[error("no acknowledgment after {attempts} attempts")]
    AckTimeout { attempts: u16 },

    /// A data frame is already in flight.
    #[error("a frame is already in flight")]
    Busy,

    /// The layer above refused further payload bytes.
    #[error("payload overflow")]
    Overflow,

    /// A retransmission of a frame that was already delivered.
    #[error("duplicate frame (seq {seq})")]
    Duplicate { seq: u8 },

    /// The engine was reset while the frame was in progress.
    #[error("frame aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, FrameError>;
