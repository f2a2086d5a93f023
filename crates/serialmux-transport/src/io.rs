use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{ByteTransport, TransportEvent};

const READ_CHUNK_SIZE: usize = 256;

/// Pause before retrying a write the device was not ready for.
const WRITE_BACKOFF: Duration = Duration::from_millis(1);

/// Serial line over a blocking `std::io` reader/writer pair.
///
/// Works with tty device files, pipes, sockets, or in-memory cursors. Puts
/// are written through immediately and complete synchronously; received
/// bytes are read in chunks and handed out one event at a time.
pub struct IoTransport<R, W> {
    reader: Option<R>,
    writer: W,
    rx: BytesMut,
    completions: VecDeque<TransportEvent>,
}

impl<R: Read, W: Write> IoTransport<R, W> {
    /// Create a transport reading from `reader` and writing to `writer`.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Some(reader),
            writer,
            rx: BytesMut::with_capacity(READ_CHUNK_SIZE),
            completions: VecDeque::new(),
        }
    }

    /// Borrow the writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Consume the transport and return the writer.
    pub fn into_writer(self) -> W {
        self.writer
    }

    /// True once the reader reported end of input and all bytes were handed out.
    pub fn is_exhausted(&self) -> bool {
        self.reader.is_none() && self.rx.is_empty()
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        loop {
            match self.writer.write(&[byte]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(WRITE_BACKOFF),
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    fn flush_writer(&mut self) -> Result<()> {
        loop {
            match self.writer.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(WRITE_BACKOFF),
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    fn fill(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    debug!("reader reached end of input");
                    self.reader = None;
                    return;
                }
                Ok(n) => {
                    trace!(n, "read chunk");
                    self.rx.extend_from_slice(&chunk[..n]);
                    return;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    debug!(error = %err, "read failed; closing receive side");
                    self.reader = None;
                    return;
                }
            }
        }
    }
}

impl<R: Read, W: Write> ByteTransport for IoTransport<R, W> {
    fn put(&mut self, byte: u8) -> Result<()> {
        let result = self.write_byte(byte);
        self.completions.push_back(TransportEvent::PutDone(result));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let result = self.flush_writer();
        self.completions.push_back(TransportEvent::FlushDone(result));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.completions.pop_front() {
            return Some(event);
        }
        if self.rx.is_empty() {
            self.fill();
        }
        if self.rx.has_remaining() {
            return Some(TransportEvent::ByteReceived(self.rx.get_u8()));
        }
        None
    }
}

impl<R, W> std::fmt::Debug for IoTransport<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoTransport")
            .field("rx_buffered", &self.rx.len())
            .field("reader_open", &self.reader.is_some())
            .finish()
    }
}
