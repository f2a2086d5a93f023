//! Serializes transport events from several producers onto one queue.
//!
//! The protocol stack must see events strictly in arrival order from a single
//! execution context. Drivers that receive bytes on one thread (or interrupt
//! handler) and complete writes on another post everything through an
//! [`EventSender`]; the stack drains the matching [`EventQueue`].

use std::io::{ErrorKind, Write};

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{ByteTransport, TransportEvent};

/// Create a connected sender/queue pair.
pub fn event_queue() -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventQueue { rx })
}

/// Producer side. Cheap to clone; usable from any thread.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSender {
    /// Post an arbitrary event.
    pub fn send(&self, event: TransportEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| TransportError::Closed)
    }

    /// Post a received byte.
    pub fn byte_received(&self, byte: u8) -> Result<()> {
        self.send(TransportEvent::ByteReceived(byte))
    }

    /// Post a put completion.
    pub fn put_done(&self, result: Result<()>) -> Result<()> {
        self.send(TransportEvent::PutDone(result))
    }

    /// Post a flush completion.
    pub fn flush_done(&self, result: Result<()>) -> Result<()> {
        self.send(TransportEvent::FlushDone(result))
    }
}

/// Consumer side, owned by the protocol stack's execution context.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventQueue {
    /// Wait for the next event. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

/// Transport whose writes go to `W` and whose events, including its own put
/// completions, flow through an [`EventQueue`].
pub struct QueuedTransport<W> {
    writer: W,
    sender: EventSender,
    queue: EventQueue,
}

impl<W: Write> QueuedTransport<W> {
    /// Create the transport and a sender for receive-side producers.
    pub fn new(writer: W) -> (Self, EventSender) {
        let (sender, queue) = event_queue();
        let producer = sender.clone();
        (
            Self {
                writer,
                sender,
                queue,
            },
            producer,
        )
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.queue.recv().await
    }

    /// Borrow the writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        loop {
            match self.writer.write(&[byte]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }
}

impl<W: Write> ByteTransport for QueuedTransport<W> {
    fn put(&mut self, byte: u8) -> Result<()> {
        let result = self.write_byte(byte);
        trace!(byte, ok = result.is_ok(), "queued put");
        self.sender.put_done(result)
    }

    fn flush(&mut self) -> Result<()> {
        let result = self.writer.flush().map_err(TransportError::Io);
        self.sender.flush_done(result)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.queue.try_next()
    }
}

impl<W> std::fmt::Debug for QueuedTransport<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTransport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_from_threads_arrive_in_post_order_per_producer() {
        let (sender, mut queue) = event_queue();

        let producer = sender.clone();
        let handle = std::thread::spawn(move || {
            for byte in 0..16u8 {
                producer.byte_received(byte).unwrap();
            }
        });
        handle.join().unwrap();
        drop(sender);

        let mut seen = Vec::new();
        while let Some(event) = queue.recv().await {
            if let TransportEvent::ByteReceived(b) = event {
                seen.push(b);
            }
        }
        assert_eq!(seen, (0..16u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn queued_transport_orders_completions_with_received_bytes() {
        let (mut transport, rx_side) = QueuedTransport::new(Vec::new());

        rx_side.byte_received(0xAA).unwrap();
        transport.put(0x7E).unwrap();
        rx_side.byte_received(0xBB).unwrap();

        assert!(matches!(
            transport.next_event().await,
            Some(TransportEvent::ByteReceived(0xAA))
        ));
        assert!(matches!(
            transport.poll_event(),
            Some(TransportEvent::PutDone(Ok(())))
        ));
        assert!(matches!(
            transport.poll_event(),
            Some(TransportEvent::ByteReceived(0xBB))
        ));
        assert!(transport.poll_event().is_none());
        assert_eq!(transport.writer(), &vec![0x7E]);
    }

    #[test]
    fn send_after_queue_dropped_reports_closed() {
        let (sender, queue) = event_queue();
        drop(queue);
        assert!(matches!(
            sender.byte_received(1),
            Err(TransportError::Closed)
        ));
    }
}
