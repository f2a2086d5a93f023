/// Errors that can occur in byte transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A byte was handed to the transport while the previous one was still
    /// being transmitted.
    #[error("transport busy (previous byte not yet sent)")]
    Busy,

    /// The line has been closed by the other side.
    #[error("transport closed")]
    Closed,

    /// An I/O error occurred on the underlying device.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fault reported by the hardware or injected by a test link.
    #[error("transport fault: {0}")]
    Fault(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
