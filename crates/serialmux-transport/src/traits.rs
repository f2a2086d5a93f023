use crate::error::Result;

/// Notification delivered by a transport to the layer above it.
#[derive(Debug)]
pub enum TransportEvent {
    /// One raw byte arrived on the line.
    ByteReceived(u8),
    /// The byte handed to [`ByteTransport::put`] finished transmitting.
    PutDone(Result<()>),
    /// The line went idle after a [`ByteTransport::flush`] request.
    FlushDone(Result<()>),
}

impl TransportEvent {
    /// Short name for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::ByteReceived(_) => "byte_received",
            TransportEvent::PutDone(_) => "put_done",
            TransportEvent::FlushDone(_) => "flush_done",
        }
    }
}

/// A duplex, byte-at-a-time serial line.
///
/// All operations are non-blocking. `put` starts transmitting exactly one
/// byte; the caller must wait for [`TransportEvent::PutDone`] before putting
/// the next one. Because some hardware double-buffers transmission, a
/// `PutDone` does not mean the line is idle; `flush` asks for an explicit
/// [`TransportEvent::FlushDone`] once it is.
pub trait ByteTransport {
    /// Start transmitting one byte.
    fn put(&mut self, byte: u8) -> Result<()>;

    /// Request a notification once all transmitted bytes have left the line.
    fn flush(&mut self) -> Result<()>;

    /// Next pending event, if any.
    ///
    /// Interrupt-driven drivers may instead push events straight into the
    /// protocol stack and return `None` here.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

impl<T: ByteTransport + ?Sized> ByteTransport for Box<T> {
    fn put(&mut self, byte: u8) -> Result<()> {
        (**self).put(byte)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        (**self).poll_event()
    }
}
