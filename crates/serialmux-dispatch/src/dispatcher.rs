use std::time::Instant;

use serialmux_frame::{
    Checksum, Crc16Xmodem, EngineStats, FrameError, FrameHandler, ProtocolConfig, ProtocolEngine,
};
use serialmux_transport::{ByteTransport, TransportError, TransportEvent};
use tracing::{debug, trace, warn};

use crate::buffer::{PacketBuffer, DEFAULT_DATA_CAPACITY, DEFAULT_HEADER_RESERVE};
use crate::error::{DispatchError, Rejected, Result};
use crate::format::FormatDescriptor;
use crate::registry::FormatRegistry;

/// Consumer of one format id.
pub trait PacketHandler {
    /// A packet of this format arrived intact.
    ///
    /// The buffer is only lent for the duration of the call; use
    /// [`Delivery::swap`] to keep it.
    fn received(&mut self, delivery: &mut Delivery<'_>);

    /// A packet sent with [`Dispatcher::send`] finished. The buffer is
    /// handed back either way.
    fn send_done(&mut self, format: u8, buffer: PacketBuffer, result: Result<()>);
}

/// Read-only view of a received packet.
pub struct Delivery<'a> {
    format: u8,
    len: usize,
    offset: usize,
    buffer: &'a mut PacketBuffer,
}

impl Delivery<'_> {
    pub fn format(&self) -> u8 {
        self.format
    }

    /// Upper-layer length of the packet.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes received after the format id, starting at the format's offset
    /// (header included).
    pub fn bytes(&self) -> &[u8] {
        self.buffer
            .as_slice()
            .get(self.offset..self.buffer.fill())
            .unwrap_or(&[])
    }

    /// The data region.
    pub fn payload(&self) -> &[u8] {
        self.buffer.payload()
    }

    pub fn buffer(&self) -> &PacketBuffer {
        &*self.buffer
    }

    /// Take the filled buffer and install `replacement` for the next
    /// reception. The replacement must have the same geometry.
    ///
    /// After a swap this view is empty.
    pub fn swap(&mut self, mut replacement: PacketBuffer) -> Result<PacketBuffer> {
        if !self.buffer.same_geometry(&replacement) {
            return Err(DispatchError::GeometryMismatch {
                expected_reserve: self.buffer.header_reserve(),
                expected_capacity: self.buffer.capacity(),
                actual_reserve: replacement.header_reserve(),
                actual_capacity: replacement.capacity(),
            });
        }
        replacement.clear();
        self.len = 0;
        Ok(std::mem::replace(self.buffer, replacement))
    }
}

/// Geometry of the dispatcher's receive buffer.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bytes reserved in front of the data region for format headers.
    /// Default: 8.
    pub header_reserve: usize,
    /// Size of the data region. Default: 120.
    pub data_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            header_reserve: DEFAULT_HEADER_RESERVE,
            data_capacity: DEFAULT_DATA_CAPACITY,
        }
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub unknown_format: u64,
    pub overflows: u64,
    /// Packets whose length did not translate or disagreed with their header.
    pub length_errors: u64,
    /// Frames with no format id byte.
    pub empty_frames: u64,
    /// Frames the engine failed (CRC, loss of sync, duplicate, abort).
    pub receive_errors: u64,
    pub sent: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone, Copy)]
enum RxPhase {
    Idle,
    AwaitFormat,
    Filling { format: u8, offset: usize },
    Unknown(u8),
    Overflow(u8),
}

struct Outgoing {
    format: u8,
    buffer: PacketBuffer,
    offset: usize,
    end: usize,
    pos: usize,
    id_sent: bool,
}

/// Everything the engine calls back into, kept apart from the engine so
/// both can be borrowed at once.
struct Hooks {
    registry: FormatRegistry,
    rx_buffer: PacketBuffer,
    rx: RxPhase,
    tx: Option<Outgoing>,
    stats: DispatchStats,
    flushed: Option<std::result::Result<(), TransportError>>,
}

impl Hooks {
    fn deliver(&mut self, format: u8, offset: usize) {
        let Some(entry) = self.registry.get_mut(format) else {
            debug!(format, "format unregistered during reception; dropped");
            return;
        };
        let data_link = self.rx_buffer.fill().saturating_sub(offset);
        let announced = self
            .rx_buffer
            .as_slice()
            .get(offset..self.rx_buffer.fill())
            .and_then(|received| entry.descriptor.expected_length(received));
        let upper = match entry.descriptor.upper_length(data_link) {
            Some(upper) if announced.is_none_or(|announced| announced == data_link) => upper,
            _ => {
                self.stats.length_errors += 1;
                debug!(format, len = data_link, ?announced, "packet length rejected");
                return;
            }
        };

        self.rx_buffer.finish_fill();
        let mut delivery = Delivery {
            format,
            len: upper,
            offset,
            buffer: &mut self.rx_buffer,
        };
        entry.handler.received(&mut delivery);
        self.stats.delivered += 1;
        trace!(format, len = upper, "packet delivered");
    }
}

impl FrameHandler for Hooks {
    fn receive_start(&mut self, seq: u8) {
        trace!(seq, "packet start");
        self.rx_buffer.clear();
        self.rx = RxPhase::AwaitFormat;
    }

    fn receive_byte(&mut self, byte: u8) -> bool {
        match self.rx {
            RxPhase::AwaitFormat => {
                match self.registry.descriptor(byte) {
                    Some(descriptor) => {
                        let offset = descriptor.offset(self.rx_buffer.header_reserve());
                        self.rx_buffer.begin_fill(byte, offset);
                        self.rx = RxPhase::Filling {
                            format: byte,
                            offset,
                        };
                    }
                    None => {
                        trace!(format = byte, "unregistered format; draining");
                        self.rx = RxPhase::Unknown(byte);
                    }
                }
                true
            }
            RxPhase::Filling { format, .. } => {
                if self.rx_buffer.push(byte) {
                    true
                } else {
                    self.rx = RxPhase::Overflow(format);
                    false
                }
            }
            RxPhase::Unknown(_) => true,
            RxPhase::Idle | RxPhase::Overflow(_) => false,
        }
    }

    fn expected_len(&self) -> Option<usize> {
        let RxPhase::Filling { format, offset } = self.rx else {
            return None;
        };
        let received = self.rx_buffer.as_slice().get(offset..self.rx_buffer.fill())?;
        let data_link = self.registry.descriptor(format)?.expected_length(received)?;
        // The format id byte precedes the data-link bytes.
        Some(data_link + 1)
    }

    fn receive_done(&mut self, result: serialmux_frame::Result<()>) {
        let phase = std::mem::replace(&mut self.rx, RxPhase::Idle);
        match (phase, result) {
            (RxPhase::Overflow(format), _) => {
                self.stats.overflows += 1;
                debug!(
                    format,
                    capacity = self.rx_buffer.capacity(),
                    "packet overflowed receive buffer"
                );
            }
            (_, Err(err)) => {
                self.stats.receive_errors += 1;
                debug!(error = %err, "packet receive failed");
            }
            (RxPhase::Filling { format, offset }, Ok(())) => self.deliver(format, offset),
            (RxPhase::Unknown(format), Ok(())) => {
                self.stats.unknown_format += 1;
                debug!(
                    error = %DispatchError::UnknownFormat(format),
                    "packet dropped"
                );
            }
            (RxPhase::AwaitFormat, Ok(())) => {
                self.stats.empty_frames += 1;
                debug!("empty frame dropped");
            }
            (RxPhase::Idle, Ok(())) => {}
        }
    }

    fn next_send_byte(&mut self) -> Option<u8> {
        let tx = self.tx.as_mut()?;
        if !tx.id_sent {
            tx.id_sent = true;
            return Some(tx.format);
        }
        if tx.pos >= tx.end {
            return None;
        }
        let byte = tx.buffer.as_slice().get(tx.pos).copied()?;
        tx.pos += 1;
        Some(byte)
    }

    fn rewind_send(&mut self) {
        if let Some(tx) = self.tx.as_mut() {
            tx.id_sent = false;
            tx.pos = tx.offset;
        }
    }

    fn send_done(&mut self, result: serialmux_frame::Result<()>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let result = result.map_err(DispatchError::from);
        match &result {
            Ok(()) => {
                self.stats.sent += 1;
                trace!(format = tx.format, "packet sent");
            }
            Err(err) => {
                self.stats.send_failures += 1;
                debug!(format = tx.format, error = %err, "packet send failed");
            }
        }
        match self.registry.get_mut(tx.format) {
            Some(entry) => entry.handler.send_done(tx.format, tx.buffer, result),
            None => warn!(format = tx.format, "send finished for unregistered format; buffer dropped"),
        }
    }

    fn flushed(&mut self, result: std::result::Result<(), TransportError>) {
        self.flushed = Some(result);
    }
}

/// Multiplexes packet formats over one protocol engine.
///
/// Owns the engine (and through it the codec and transport), one receive
/// buffer, and at most one outgoing buffer. Only one packet is in flight per
/// direction; callers that need queueing use [`SendQueue`](crate::SendQueue).
pub struct Dispatcher<T, C = Crc16Xmodem> {
    engine: ProtocolEngine<T, C>,
    hooks: Hooks,
    config: DispatcherConfig,
}

impl<T: ByteTransport> Dispatcher<T> {
    /// Create a dispatcher with default engine and buffer configuration.
    pub fn new(transport: T) -> Self {
        Self::with_config(
            transport,
            ProtocolConfig::default(),
            DispatcherConfig::default(),
        )
    }

    /// Create a dispatcher with explicit configuration.
    pub fn with_config(transport: T, protocol: ProtocolConfig, config: DispatcherConfig) -> Self {
        Self::with_engine(ProtocolEngine::with_config(transport, protocol), config)
    }
}

impl<T: ByteTransport, C: Checksum> Dispatcher<T, C> {
    /// Create a dispatcher on top of an existing engine.
    pub fn with_engine(engine: ProtocolEngine<T, C>, config: DispatcherConfig) -> Self {
        let rx_buffer = PacketBuffer::new(config.header_reserve, config.data_capacity);
        Self {
            engine,
            hooks: Hooks {
                registry: FormatRegistry::new(),
                rx_buffer,
                rx: RxPhase::Idle,
                tx: None,
                stats: DispatchStats::default(),
                flushed: None,
            },
            config,
        }
    }

    /// Register a format and its consumer.
    pub fn register(
        &mut self,
        format: u8,
        descriptor: impl FormatDescriptor + 'static,
        handler: impl PacketHandler + 'static,
    ) -> Result<()> {
        if descriptor.header_len() > self.config.header_reserve {
            return Err(DispatchError::BufferTooSmall {
                required: descriptor.header_len(),
                available: self.config.header_reserve,
            });
        }
        self.hooks
            .registry
            .register(format, Box::new(descriptor), Box::new(handler))?;
        debug!(format, "format registered");
        Ok(())
    }

    /// Remove a format, returning its consumer.
    pub fn unregister(&mut self, format: u8) -> Option<Box<dyn PacketHandler>> {
        self.hooks.registry.unregister(format)
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.hooks.registry
    }

    /// A fresh buffer with this dispatcher's geometry.
    pub fn new_buffer(&self) -> PacketBuffer {
        PacketBuffer::new(self.config.header_reserve, self.config.data_capacity)
    }

    /// Check that `buffer` can carry `upper_len` bytes of `format`.
    /// Returns the first and one-past-last buffer index to transmit.
    pub fn validate(
        &self,
        format: u8,
        buffer: &PacketBuffer,
        upper_len: usize,
    ) -> Result<(usize, usize)> {
        let descriptor = self
            .hooks
            .registry
            .descriptor(format)
            .ok_or(DispatchError::UnknownFormat(format))?;
        if descriptor.header_len() > buffer.header_reserve() {
            return Err(DispatchError::BufferTooSmall {
                required: descriptor.header_len(),
                available: buffer.header_reserve(),
            });
        }
        let offset = descriptor.offset(buffer.header_reserve());
        descriptor
            .data_link_length(upper_len)
            .map(|data_link| offset + data_link)
            .filter(|&end| end <= buffer.total_len())
            .map(|end| (offset, end))
            .ok_or(DispatchError::LengthOutOfRange {
                format,
                len: upper_len,
            })
    }

    /// Start sending `upper_len` bytes of `format` from `buffer`.
    ///
    /// The outcome and the buffer come back through the format's
    /// [`PacketHandler::send_done`]. A refused request returns the buffer
    /// in the error.
    pub fn send(
        &mut self,
        format: u8,
        mut buffer: PacketBuffer,
        upper_len: usize,
    ) -> std::result::Result<(), Rejected> {
        if self.is_sending() {
            return Err(Rejected::new(DispatchError::Busy, buffer));
        }
        let (offset, end) = match self.validate(format, &buffer, upper_len) {
            Ok(range) => range,
            Err(err) => return Err(Rejected::new(err, buffer)),
        };

        buffer.set_format(format);
        self.hooks.tx = Some(Outgoing {
            format,
            buffer,
            offset,
            end,
            pos: offset,
            id_sent: false,
        });
        debug!(format, len = upper_len, "packet send requested");
        if let Err(err) = self.engine.send(&mut self.hooks) {
            if let Some(tx) = self.hooks.tx.take() {
                return Err(Rejected::new(err.into(), tx.buffer));
            }
        }
        Ok(())
    }

    /// Feed one transport event through the stack.
    pub fn handle_event(&mut self, event: TransportEvent) {
        self.engine.handle_event(event, &mut self.hooks);
    }

    /// Drain and handle every event the transport has ready. Returns the
    /// number handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.engine.transport_mut().poll_event() {
            self.engine.handle_event(event, &mut self.hooks);
            handled += 1;
        }
        handled
    }

    /// Drive acknowledgment timeouts.
    pub fn poll_timeout(&mut self, now: Instant) {
        self.engine.poll_timeout(now, &mut self.hooks);
    }

    /// When the engine next needs [`poll_timeout`](Self::poll_timeout).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.engine.next_deadline()
    }

    /// Request a transmit-idle notification; collect it with
    /// [`take_flush_result`](Self::take_flush_result).
    pub fn flush(&mut self) -> Result<()> {
        self.hooks.flushed = None;
        self.engine.flush().map_err(DispatchError::from)
    }

    pub fn take_flush_result(&mut self) -> Option<std::result::Result<(), TransportError>> {
        self.hooks.flushed.take()
    }

    /// Reset the stack. A packet being sent is returned to its consumer
    /// with [`FrameError::Aborted`].
    pub fn abort(&mut self) {
        self.engine.abort(&mut self.hooks);
        if let Some(tx) = self.hooks.tx.take() {
            // The engine had not started this packet yet.
            if let Some(entry) = self.hooks.registry.get_mut(tx.format) {
                entry
                    .handler
                    .send_done(tx.format, tx.buffer, Err(FrameError::Aborted.into()));
            }
        }
        self.hooks.rx = RxPhase::Idle;
    }

    /// True while a packet is being sent or waits for its ACK.
    pub fn is_sending(&self) -> bool {
        self.hooks.tx.is_some() || self.engine.is_sending()
    }

    pub fn stats(&self) -> DispatchStats {
        self.hooks.stats
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn engine(&self) -> &ProtocolEngine<T, C> {
        &self.engine
    }

    pub fn transport(&self) -> &T {
        self.engine.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.engine.transport_mut()
    }

    pub fn into_transport(self) -> T {
        self.engine.into_transport()
    }
}

impl<T, C> std::fmt::Debug for Dispatcher<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("engine", &self.engine)
            .field("formats", &self.hooks.registry)
            .field("rx", &self.hooks.rx)
            .field("sending", &self.hooks.tx.as_ref().map(|tx| tx.format))
            .field("stats", &self.hooks.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::BytesMut;
    use serialmux_frame::{encode_frame, ProtocolByte};
    use serialmux_transport::{MemoryLink, MemoryTransport};

    use super::*;
    use crate::am::AmHeader;
    use crate::format::{ActiveMessageFormat, RawFormat, FORMAT_ACTIVE_MESSAGE, FORMAT_UNKNOWN};

    const RAW: u8 = 0x07;

    #[derive(Default)]
    struct Log {
        received: Vec<(u8, usize, Vec<u8>, Vec<u8>)>,
        sent: Vec<(u8, Result<()>)>,
        returned: Vec<PacketBuffer>,
        kept: Vec<PacketBuffer>,
        swap_errors: usize,
    }

    struct Consumer {
        log: Rc<RefCell<Log>>,
        spares: Vec<PacketBuffer>,
    }

    impl Consumer {
        fn new(log: &Rc<RefCell<Log>>) -> Self {
            Self {
                log: Rc::clone(log),
                spares: Vec::new(),
            }
        }
    }

    impl PacketHandler for Consumer {
        fn received(&mut self, delivery: &mut Delivery<'_>) {
            let mut log = self.log.borrow_mut();
            log.received.push((
                delivery.format(),
                delivery.len(),
                delivery.bytes().to_vec(),
                delivery.payload().to_vec(),
            ));
            if let Some(spare) = self.spares.pop() {
                match delivery.swap(spare) {
                    Ok(filled) => log.kept.push(filled),
                    Err(_) => log.swap_errors += 1,
                }
            }
        }

        fn send_done(&mut self, format: u8, buffer: PacketBuffer, result: Result<()>) {
            let mut log = self.log.borrow_mut();
            log.sent.push((format, result));
            log.returned.push(buffer);
        }
    }

    fn frame(proto: ProtocolByte, seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        encode_frame(&Crc16Xmodem, proto, seq, payload, &mut wire);
        wire.to_vec()
    }

    fn dispatcher(
        protocol: ProtocolConfig,
        config: DispatcherConfig,
    ) -> (Dispatcher<MemoryTransport>, MemoryLink, Rc<RefCell<Log>>) {
        let (transport, link) = MemoryTransport::new();
        let mut dispatcher = Dispatcher::with_config(transport, protocol, config);
        let log = Rc::new(RefCell::new(Log::default()));
        dispatcher
            .register(FORMAT_ACTIVE_MESSAGE, ActiveMessageFormat, Consumer::new(&log))
            .unwrap();
        dispatcher
            .register(RAW, RawFormat, Consumer::new(&log))
            .unwrap();
        (dispatcher, link, log)
    }

    fn device() -> (Dispatcher<MemoryTransport>, MemoryLink, Rc<RefCell<Log>>) {
        dispatcher(ProtocolConfig::device(), DispatcherConfig::default())
    }

    #[test]
    fn active_message_send_produces_exact_wire_bytes() {
        let host = ProtocolConfig {
            initial_sequence: 9,
            ..ProtocolConfig::host()
        };
        let (mut dispatcher, link, log) = dispatcher(host, DispatcherConfig::default());

        let mut buffer = dispatcher.new_buffer();
        let len = ActiveMessageFormat::prepare(
            &mut buffer,
            AmHeader::new(0xBEEF, 0x7D, 6),
            &[1, 2, 3, 4, 5],
        )
        .unwrap();
        dispatcher
            .send(FORMAT_ACTIVE_MESSAGE, buffer, len)
            .unwrap();
        dispatcher.process_pending();

        let wire = link.take_sent();
        let prefix = [
            0x7E, 0x40, 0x09, 0x00, 0xBE, 0xEF, 0x05, 0x7D, 0x5D, 0x06, 0x01, 0x02, 0x03, 0x04,
            0x05,
        ];
        assert_eq!(&wire[..prefix.len()], &prefix);
        // CRC-16/XMODEM 0x9E79, low byte first.
        assert_eq!(&wire[prefix.len()..], &[0x79, 0x9E, 0x7E]);
        assert_eq!(
            wire,
            frame(
                ProtocolByte::DataAcked,
                9,
                &[0x00, 0xBE, 0xEF, 0x05, 0x7D, 0x06, 1, 2, 3, 4, 5]
            )
        );
        assert_eq!(wire.last(), Some(&0x7E));
        assert!(dispatcher.is_sending(), "waits for the ack");

        link.inject(&frame(ProtocolByte::Ack, 9, &[]));
        dispatcher.process_pending();

        let log = log.borrow();
        assert!(matches!(log.sent[..], [(FORMAT_ACTIVE_MESSAGE, Ok(()))]));
        assert_eq!(log.returned[0].payload(), &[1, 2, 3, 4, 5]);
        assert!(!dispatcher.is_sending());
        assert_eq!(dispatcher.stats().sent, 1);
    }

    #[test]
    fn active_message_delivered_from_header_offset() {
        let (mut dispatcher, link, log) = device();

        let packet = [0x00, 0x12, 0x34, 0x03, 0x22, 0x09, 7, 8, 9];
        link.inject(&frame(ProtocolByte::DataAcked, 3, &packet));
        dispatcher.process_pending();

        let log = log.borrow();
        assert_eq!(log.received.len(), 1);
        let (format, len, bytes, payload) = &log.received[0];
        assert_eq!(*format, FORMAT_ACTIVE_MESSAGE);
        assert_eq!(*len, 3);
        assert_eq!(bytes, &packet[1..]);
        assert_eq!(payload, &[7, 8, 9]);
        assert_eq!(
            AmHeader::read_from(bytes),
            Some(AmHeader {
                dest: 0x1234,
                length: 3,
                group: 0x22,
                am_type: 9,
            })
        );
        assert_eq!(link.take_sent(), frame(ProtocolByte::Ack, 3, &[]));
        assert_eq!(dispatcher.stats().delivered, 1);
    }

    #[test]
    fn unknown_format_is_drained_acked_and_not_delivered() {
        let (mut dispatcher, link, log) = device();

        link.inject(&frame(ProtocolByte::DataAcked, 4, &[0x33, 1, 2, 3]));
        link.inject(&frame(ProtocolByte::DataAcked, 5, &[FORMAT_UNKNOWN, 1]));
        link.inject(&frame(ProtocolByte::DataAcked, 6, &[RAW, 0xAA]));
        dispatcher.process_pending();

        let log = log.borrow();
        assert_eq!(log.received.len(), 1);
        assert_eq!(log.received[0].0, RAW);
        assert_eq!(dispatcher.stats().unknown_format, 2);

        let mut acks = frame(ProtocolByte::Ack, 4, &[]);
        acks.extend(frame(ProtocolByte::Ack, 5, &[]));
        acks.extend(frame(ProtocolByte::Ack, 6, &[]));
        assert_eq!(link.take_sent(), acks);
    }

    #[test]
    fn oversized_packet_overflows_and_next_packet_arrives() {
        let config = DispatcherConfig {
            header_reserve: 8,
            data_capacity: 4,
        };
        let (mut dispatcher, link, log) = dispatcher(ProtocolConfig::device(), config);

        link.inject(&frame(ProtocolByte::Data, 1, &[RAW, 1, 2, 3, 4, 5, 6, 7]));
        link.inject(&frame(ProtocolByte::Data, 2, &[RAW, 1, 2]));
        dispatcher.process_pending();

        let log = log.borrow();
        assert_eq!(log.received.len(), 1);
        assert_eq!(log.received[0].3, vec![1, 2]);
        assert_eq!(dispatcher.stats().overflows, 1);
    }

    #[test]
    fn active_message_length_must_match_header() {
        let (mut dispatcher, link, log) = device();

        // Header announces 2 data bytes, 3 follow.
        link.inject(&frame(ProtocolByte::Data, 1, &[0x00, 0, 1, 2, 0, 0, 7, 8, 9]));
        // Header announces 4 data bytes, the frame ends after 2.
        link.inject(&frame(ProtocolByte::Data, 2, &[0x00, 0, 1, 4, 0, 0, 7, 8]));
        dispatcher.process_pending();

        assert!(log.borrow().received.is_empty());
        assert_eq!(dispatcher.stats().length_errors, 1);
        assert_eq!(dispatcher.stats().receive_errors, 1);
        assert_eq!(dispatcher.engine_stats().loss_of_sync, 1);
    }

    #[test]
    fn crc_failure_is_not_delivered() {
        let (mut dispatcher, link, log) = device();

        let mut wire = frame(ProtocolByte::Data, 1, &[RAW, 1, 2, 3]);
        wire[5] ^= 0x08;
        link.inject(&wire);
        dispatcher.process_pending();

        assert!(log.borrow().received.is_empty());
        assert_eq!(dispatcher.stats().receive_errors, 1);
        assert_eq!(dispatcher.engine_stats().crc_errors, 1);
    }

    #[test]
    fn swap_hands_off_buffer_without_copy() {
        let (transport, link) = MemoryTransport::new();
        let mut dispatcher = Dispatcher::new(transport);
        let log = Rc::new(RefCell::new(Log::default()));
        let mut consumer = Consumer::new(&log);
        consumer.spares.push(dispatcher.new_buffer());
        dispatcher.register(RAW, RawFormat, consumer).unwrap();

        link.inject(&frame(ProtocolByte::Data, 1, &[RAW, 1, 1, 1]));
        link.inject(&frame(ProtocolByte::Data, 2, &[RAW, 2, 2]));
        dispatcher.process_pending();

        let log = log.borrow();
        assert_eq!(log.received.len(), 2);
        assert_eq!(log.kept.len(), 1);
        assert_eq!(log.kept[0].payload(), &[1, 1, 1]);
        assert_eq!(log.kept[0].format(), RAW);
        assert_eq!(log.received[1].3, vec![2, 2]);
    }

    #[test]
    fn swap_rejects_other_geometry() {
        let (transport, link) = MemoryTransport::new();
        let mut dispatcher = Dispatcher::new(transport);
        let log = Rc::new(RefCell::new(Log::default()));
        let mut consumer = Consumer::new(&log);
        consumer.spares.push(PacketBuffer::new(2, 16));
        dispatcher.register(RAW, RawFormat, consumer).unwrap();

        link.inject(&frame(ProtocolByte::Data, 1, &[RAW, 5]));
        link.inject(&frame(ProtocolByte::Data, 2, &[RAW, 6]));
        dispatcher.process_pending();

        let log = log.borrow();
        assert_eq!(log.swap_errors, 1);
        assert!(log.kept.is_empty());
        assert_eq!(log.received.len(), 2);
    }

    #[test]
    fn send_rejections_return_the_buffer() {
        let (mut dispatcher, _link, _log) = device();

        let mut buffer = dispatcher.new_buffer();
        buffer.set_payload(&[1, 2, 3]).unwrap();
        let rejected = dispatcher.send(0x55, buffer, 3).unwrap_err();
        assert!(matches!(rejected.error, DispatchError::UnknownFormat(0x55)));
        assert_eq!(rejected.buffer.payload(), &[1, 2, 3]);

        let (_, buffer) = rejected.into_parts();
        let rejected = dispatcher.send(RAW, buffer, 500).unwrap_err();
        assert!(matches!(
            rejected.error,
            DispatchError::LengthOutOfRange { format: RAW, len: 500 }
        ));

        let rejected = dispatcher
            .send(FORMAT_ACTIVE_MESSAGE, PacketBuffer::new(2, 16), 1)
            .unwrap_err();
        assert!(matches!(
            rejected.error,
            DispatchError::BufferTooSmall { required: 5, .. }
        ));
    }

    #[test]
    fn second_send_is_busy() {
        let (mut dispatcher, _link, _log) = device();
        let buffer = dispatcher.new_buffer();
        dispatcher.send(RAW, buffer, 0).unwrap();

        let rejected = dispatcher.send(RAW, dispatcher.new_buffer(), 0).unwrap_err();
        assert!(matches!(rejected.error, DispatchError::Busy));
    }

    #[test]
    fn register_rejects_header_larger_than_reserve() {
        let (transport, _link) = MemoryTransport::new();
        let mut dispatcher = Dispatcher::with_config(
            transport,
            ProtocolConfig::device(),
            DispatcherConfig {
                header_reserve: 4,
                data_capacity: 32,
            },
        );
        let log = Rc::new(RefCell::new(Log::default()));
        let err = dispatcher
            .register(FORMAT_ACTIVE_MESSAGE, ActiveMessageFormat, Consumer::new(&log))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::BufferTooSmall {
                required: 5,
                available: 4
            }
        ));
    }

    #[test]
    fn abort_returns_buffer_with_aborted() {
        let (mut dispatcher, _link, log) = device();
        let mut buffer = dispatcher.new_buffer();
        buffer.set_payload(&[9, 9]).unwrap();
        dispatcher.send(RAW, buffer, 2).unwrap();

        dispatcher.abort();

        let log = log.borrow();
        assert!(matches!(
            log.sent[..],
            [(RAW, Err(DispatchError::Frame(FrameError::Aborted)))]
        ));
        assert_eq!(log.returned[0].payload(), &[9, 9]);
        assert!(!dispatcher.is_sending());
    }

    #[test]
    fn ack_timeout_is_relayed_to_consumer() {
        let host = ProtocolConfig {
            max_retries: 0,
            ..ProtocolConfig::host()
        };
        let (mut dispatcher, link, log) = dispatcher(host, DispatcherConfig::default());
        dispatcher.send(RAW, dispatcher.new_buffer(), 0).unwrap();
        dispatcher.process_pending();
        assert_eq!(link.take_sent(), frame(ProtocolByte::DataAcked, 0, &[RAW]));

        let deadline = dispatcher.next_deadline().unwrap();
        dispatcher.poll_timeout(deadline);

        assert!(matches!(
            log.borrow().sent[..],
            [(RAW, Err(DispatchError::Frame(FrameError::AckTimeout { attempts: 1 })))]
        ));
        assert_eq!(dispatcher.stats().send_failures, 1);
    }

    #[test]
    fn flush_result_is_collected() {
        let (mut dispatcher, _link, _log) = device();
        dispatcher.flush().unwrap();
        assert!(dispatcher.take_flush_result().is_none());
        dispatcher.process_pending();
        assert!(matches!(dispatcher.take_flush_result(), Some(Ok(()))));
    }

    #[test]
    fn host_and_device_exchange_packets() {
        let (host_tx, device_tx) = MemoryTransport::pair();
        let host_log = Rc::new(RefCell::new(Log::default()));
        let device_log = Rc::new(RefCell::new(Log::default()));
        let mut host =
            Dispatcher::with_config(host_tx, ProtocolConfig::host(), DispatcherConfig::default());
        let mut device = Dispatcher::with_config(
            device_tx,
            ProtocolConfig::device(),
            DispatcherConfig::default(),
        );
        host.register(FORMAT_ACTIVE_MESSAGE, ActiveMessageFormat, Consumer::new(&host_log))
            .unwrap();
        device
            .register(FORMAT_ACTIVE_MESSAGE, ActiveMessageFormat, Consumer::new(&device_log))
            .unwrap();

        let mut buffer = host.new_buffer();
        let len =
            ActiveMessageFormat::prepare(&mut buffer, AmHeader::new(1, 0x22, 0x10), b"ping")
                .unwrap();
        host.send(FORMAT_ACTIVE_MESSAGE, buffer, len).unwrap();
        while host.process_pending() + device.process_pending() > 0 {}

        let mut buffer = device.new_buffer();
        let len =
            ActiveMessageFormat::prepare(&mut buffer, AmHeader::new(0, 0x22, 0x11), b"pong")
                .unwrap();
        device.send(FORMAT_ACTIVE_MESSAGE, buffer, len).unwrap();
        while host.process_pending() + device.process_pending() > 0 {}

        assert_eq!(device_log.borrow().received[0].3, b"ping".to_vec());
        assert_eq!(host_log.borrow().received[0].3, b"pong".to_vec());
        assert!(matches!(host_log.borrow().sent[..], [(FORMAT_ACTIVE_MESSAGE, Ok(()))]));
        assert!(matches!(device_log.borrow().sent[..], [(FORMAT_ACTIVE_MESSAGE, Ok(()))]));
        assert_eq!(host.engine_stats().frames_sent, 1);
        assert_eq!(device.engine_stats().acks_sent, 1);
    }
}
