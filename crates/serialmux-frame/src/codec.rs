use bytes::{BufMut, BytesMut};
use serialmux_transport::{ByteTransport, TransportError, TransportEvent};
use tracing::trace;

use crate::crc::Checksum;
use crate::protocol::{needs_escape, ProtocolByte, DELIMITER, ESCAPE, ESCAPE_XOR};

/// Frame-level event produced by the codec from a transport event.
#[derive(Debug)]
pub enum CodecEvent {
    /// A delimiter arrived.
    Delimiter,
    /// An unescaped data byte arrived.
    Data(u8),
    /// The logical byte handed to `send_data`/`send_delimiter` finished
    /// transmitting (both physical bytes, for an escaped byte).
    SendDone(Result<(), TransportError>),
    /// The transport reported the line idle.
    FlushDone(Result<(), TransportError>),
}

/// Byte-stuffing layer between the raw transport and the protocol engine.
///
/// Turns wire bytes into delimiter/data events and back. Escaping:
/// `0x7E` and `0x7D` inside a frame are sent as `0x7D, byte ^ 0x20`.
///
/// The codec never fails on malformed input; an escape followed by a
/// delimiter is treated as a plain delimiter and the stale escape is dropped.
/// Detecting corruption is the engine's job.
pub struct FrameCodec<T> {
    transport: T,
    rx_escaped: bool,
    tx_escaped: bool,
    tx_pending: u8,
    tx_active: bool,
}

impl<T: ByteTransport> FrameCodec<T> {
    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            rx_escaped: false,
            tx_escaped: false,
            tx_pending: 0,
            tx_active: false,
        }
    }

    /// Send a frame delimiter.
    pub fn send_delimiter(&mut self) -> Result<(), TransportError> {
        self.put(DELIMITER)
    }

    /// Send one data byte, escaping it if needed.
    ///
    /// Completion is reported once, after the last physical byte is sent.
    pub fn send_data(&mut self, byte: u8) -> Result<(), TransportError> {
        if needs_escape(byte) {
            self.put(ESCAPE)?;
            self.tx_escaped = true;
            self.tx_pending = byte ^ ESCAPE_XOR;
            Ok(())
        } else {
            self.put(byte)
        }
    }

    /// Ask the transport for an idle notification.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.transport.flush()
    }

    /// Translate one transport event.
    ///
    /// Returns `None` when the event is consumed silently (an escape byte on
    /// receive, or the first half of an escaped byte on send).
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<CodecEvent> {
        match event {
            TransportEvent::ByteReceived(byte) => self.receive_byte(byte),
            TransportEvent::PutDone(Ok(())) if self.tx_escaped => {
                self.tx_escaped = false;
                match self.transport.put(self.tx_pending) {
                    Ok(()) => None,
                    Err(err) => {
                        self.tx_active = false;
                        Some(CodecEvent::SendDone(Err(err)))
                    }
                }
            }
            TransportEvent::PutDone(result) => {
                self.tx_escaped = false;
                self.tx_active = false;
                Some(CodecEvent::SendDone(result))
            }
            TransportEvent::FlushDone(result) => Some(CodecEvent::FlushDone(result)),
        }
    }

    /// Decode one received wire byte.
    pub fn receive_byte(&mut self, byte: u8) -> Option<CodecEvent> {
        match byte {
            DELIMITER => {
                if self.rx_escaped {
                    trace!("delimiter after escape; dropping escape");
                }
                self.rx_escaped = false;
                Some(CodecEvent::Delimiter)
            }
            ESCAPE => {
                self.rx_escaped = true;
                None
            }
            _ if self.rx_escaped => {
                self.rx_escaped = false;
                Some(CodecEvent::Data(byte ^ ESCAPE_XOR))
            }
            _ => Some(CodecEvent::Data(byte)),
        }
    }

    /// Drop any half-sent escape sequence.
    ///
    /// A physical byte already handed to the transport still completes and
    /// is reported as `SendDone`.
    pub fn reset_send(&mut self) {
        self.tx_escaped = false;
    }

    /// Drop a pending receive escape.
    pub fn reset_receive(&mut self) {
        self.rx_escaped = false;
    }

    /// True while a logical byte is being transmitted.
    pub fn is_sending(&self) -> bool {
        self.tx_active
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the codec and return the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn put(&mut self, byte: u8) -> Result<(), TransportError> {
        if self.tx_active {
            return Err(TransportError::Busy);
        }
        self.transport.put(byte)?;
        self.tx_active = true;
        Ok(())
    }
}

/// Encode a complete frame into its wire representation in one call.
///
/// Produces exactly the bytes the engine emits for the same frame; useful
/// for host tools and tests that do not run the event-driven stack.
pub fn encode_frame<C: Checksum + ?Sized>(
    checksum: &C,
    proto: ProtocolByte,
    seq: u8,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let crc = payload
        .iter()
        .fold(checksum.update(checksum.init(), seq), |crc, &byte| {
            checksum.update(crc, byte)
        });

    dst.reserve(2 * (payload.len() + 4) + 2);
    dst.put_u8(DELIMITER);
    let body = [proto.as_byte(), seq]
        .into_iter()
        .chain(payload.iter().copied())
        .chain(crc.to_le_bytes());
    for byte in body {
        if needs_escape(byte) {
            dst.put_u8(ESCAPE);
            dst.put_u8(byte ^ ESCAPE_XOR);
        } else {
            dst.put_u8(byte);
        }
    }
    dst.put_u8(DELIMITER);
}

impl<T> std::fmt::Debug for FrameCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("rx_escaped", &self.rx_escaped)
            .field("tx_escaped", &self.tx_escaped)
            .field("tx_active", &self.tx_active)
            .finish()
    }
}
