use std::collections::VecDeque;
use std::time::Instant;

use serialmux_transport::{ByteTransport, TransportError, TransportEvent};
use tracing::{debug, trace, warn};

use crate::codec::{CodecEvent, FrameCodec};
use crate::config::{OutboundMode, ProtocolConfig};
use crate::crc::{Checksum, Crc16Xmodem};
use crate::error::{FrameError, Result};
use crate::protocol::ProtocolByte;

/// Upcalls from the engine into the packet layer above it.
///
/// Receive: `receive_start`, then one `receive_byte` per payload byte, then
/// exactly one `receive_done`. Send: after [`ProtocolEngine::send`] the
/// engine pulls payload through `next_send_byte` until it returns `None`, and
/// reports the outcome through `send_done`.
pub trait FrameHandler {
    /// A data frame with sequence number `seq` started arriving.
    fn receive_start(&mut self, seq: u8);

    /// One payload byte of the current frame. Return `false` to refuse it;
    /// the rest of the frame is drained and the frame fails with
    /// [`FrameError::Overflow`].
    fn receive_byte(&mut self, byte: u8) -> bool;

    /// Payload length the current frame must reach, once the layer above
    /// knows it. A delimiter before that length is loss of sync.
    fn expected_len(&self) -> Option<usize> {
        None
    }

    /// The current inbound frame finished.
    fn receive_done(&mut self, result: Result<()>);

    /// Next payload byte of the outbound frame, `None` at end of payload.
    fn next_send_byte(&mut self) -> Option<u8>;

    /// Restart the outbound payload from its first byte (retransmission).
    fn rewind_send(&mut self);

    /// The outbound frame finished.
    fn send_done(&mut self, result: Result<()>);

    /// The transport reported the line idle after [`ProtocolEngine::flush`].
    fn flushed(&mut self, result: std::result::Result<(), TransportError>) {
        let _ = result;
    }
}

/// Counters maintained by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub acks_sent: u64,
    pub nacks_sent: u64,
    pub crc_errors: u64,
    pub loss_of_sync: u64,
    pub duplicates: u64,
    pub overflows: u64,
    pub retransmissions: u64,
    pub ack_timeouts: u64,
    pub unknown_protocol: u64,
    pub dropped_acks: u64,
}

/// Sequence numbers on both sides of the acknowledged direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceState {
    /// Sequence number the next new data frame will carry.
    pub next: u8,
    /// Sequence number of the most recent outbound data frame.
    pub last_sent: Option<u8>,
    /// Most recent outbound sequence number the peer acknowledged.
    pub last_acked: Option<u8>,
    /// Most recent acknowledged inbound sequence number delivered upward.
    pub last_received: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    /// Not synchronized; waiting for a delimiter.
    Idle,
    Type,
    Seq,
    /// Payload and CRC bytes. The last two bytes before the closing
    /// delimiter are the CRC, so they are held back from the layer above.
    Payload,
    /// Unknown protocol byte; skip to the next delimiter.
    Drain,
}

#[derive(Debug)]
struct RxFrame {
    state: RxState,
    proto: ProtocolByte,
    seq: u8,
    crc: u16,
    held: [u8; 2],
    held_len: usize,
    payload_len: usize,
    overflow: bool,
    started: bool,
}

impl RxFrame {
    fn new(state: RxState) -> Self {
        Self {
            state,
            proto: ProtocolByte::Data,
            seq: 0,
            crc: 0,
            held: [0; 2],
            held_len: 0,
            payload_len: 0,
            overflow: false,
            started: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Open,
    Proto,
    Seq,
    Payload(u8),
    CrcLo,
    CrcHi,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineFrame {
    Data,
    Control { proto: ProtocolByte, seq: u8 },
}

#[derive(Debug, Clone, Copy)]
struct Line {
    frame: LineFrame,
    stage: Stage,
    crc: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataState {
    Idle,
    /// Requested but not yet started on the line.
    Pending,
    OnWire,
    AwaitAck(Instant),
}

#[derive(Debug)]
struct DataTx {
    state: DataState,
    proto: ProtocolByte,
    seq: u8,
    /// Transmissions of the current frame; one more than `u8` retries allow.
    attempts: u16,
    early_reply: Option<ProtocolByte>,
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    proto: ProtocolByte,
    seq: u8,
}

/// Frame-level state machine on top of a [`FrameCodec`].
///
/// Owns the codec (and through it the transport). Receives frames,
/// verifies their CRC, acknowledges `DATA_ACKED` frames, and transmits one
/// data frame at a time with stop-and-wait retransmission when configured
/// for [`OutboundMode::Acknowledged`]. Pending ACK/NACK frames are sent at
/// frame boundaries ahead of a data frame that has not started yet.
pub struct ProtocolEngine<T, C = Crc16Xmodem> {
    codec: FrameCodec<T>,
    checksum: C,
    config: ProtocolConfig,
    rx: RxFrame,
    acks: VecDeque<PendingAck>,
    line: Option<Line>,
    data: DataTx,
    window: VecDeque<u8>,
    payload_ended: bool,
    seq: SequenceState,
    stats: EngineStats,
}

impl<T: ByteTransport> ProtocolEngine<T> {
    /// Create an engine with default configuration and CRC-16/XMODEM.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ProtocolConfig::default())
    }

    /// Create an engine with explicit configuration and CRC-16/XMODEM.
    pub fn with_config(transport: T, config: ProtocolConfig) -> Self {
        Self::with_checksum(transport, config, Crc16Xmodem)
    }
}

impl<T: ByteTransport, C: Checksum> ProtocolEngine<T, C> {
    /// Create an engine with explicit configuration and checksum strategy.
    pub fn with_checksum(transport: T, config: ProtocolConfig, checksum: C) -> Self {
        let config = config.normalized();
        let seq = SequenceState {
            next: config.initial_sequence,
            ..SequenceState::default()
        };
        Self {
            codec: FrameCodec::new(transport),
            checksum,
            acks: VecDeque::with_capacity(config.ack_queue_depth),
            window: VecDeque::with_capacity(config.lookahead),
            config,
            rx: RxFrame::new(RxState::Idle),
            line: None,
            data: DataTx {
                state: DataState::Idle,
                proto: ProtocolByte::Data,
                seq: 0,
                attempts: 0,
                early_reply: None,
            },
            payload_ended: false,
            seq,
            stats: EngineStats::default(),
        }
    }

    /// Start sending a data frame whose payload is pulled from `handler`.
    ///
    /// Returns [`FrameError::Busy`] while a previous data frame is in flight
    /// (including while it waits for its ACK). The outcome is reported
    /// through [`FrameHandler::send_done`].
    pub fn send<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        if self.data.state != DataState::Idle {
            return Err(FrameError::Busy);
        }
        let proto = match self.config.outbound {
            OutboundMode::BestEffort => ProtocolByte::Data,
            OutboundMode::Acknowledged => ProtocolByte::DataAcked,
        };
        let seq = self.seq.next;
        self.seq.next = seq.wrapping_add(1);
        self.seq.last_sent = Some(seq);
        self.data = DataTx {
            state: DataState::Pending,
            proto,
            seq,
            attempts: 0,
            early_reply: None,
        };
        debug!(seq, proto = proto.name(), "data frame queued");
        self.start_next(handler);
        Ok(())
    }

    /// Feed one transport event through the codec and the engine.
    pub fn handle_event<H: FrameHandler + ?Sized>(
        &mut self,
        event: TransportEvent,
        handler: &mut H,
    ) {
        let Some(event) = self.codec.handle_event(event) else {
            return;
        };
        match event {
            CodecEvent::Delimiter => self.on_delimiter(handler),
            CodecEvent::Data(byte) => self.on_data(byte, handler),
            CodecEvent::SendDone(result) => self.on_send_done(result, handler),
            CodecEvent::FlushDone(result) => handler.flushed(result),
        }
    }

    /// Retransmit or fail the outstanding acknowledged frame if its ACK
    /// deadline has passed.
    pub fn poll_timeout<H: FrameHandler + ?Sized>(&mut self, now: Instant, handler: &mut H) {
        if let DataState::AwaitAck(deadline) = self.data.state {
            if now >= deadline {
                self.stats.ack_timeouts += 1;
                debug!(
                    seq = self.data.seq,
                    attempt = self.data.attempts,
                    "ack timeout"
                );
                self.retransmit(handler);
            }
        }
    }

    /// When the outstanding frame's ACK deadline expires, if one is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.data.state {
            DataState::AwaitAck(deadline) => Some(deadline),
            _ => None,
        }
    }

    /// Request transmit-idle notification ([`FrameHandler::flushed`]).
    pub fn flush(&mut self) -> Result<()> {
        self.codec.flush().map_err(FrameError::from)
    }

    /// Force both directions back to idle.
    ///
    /// An inbound frame in progress and an outbound data frame in flight
    /// both fail with [`FrameError::Aborted`]; queued ACKs are discarded.
    /// The receiver resynchronizes on the next delimiter.
    pub fn abort<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) {
        self.codec.reset_send();
        self.codec.reset_receive();

        let rx = std::mem::replace(&mut self.rx, RxFrame::new(RxState::Idle));
        self.finish_rx(rx.started, Err(FrameError::Aborted), handler);

        self.acks.clear();
        self.line = None;
        self.window.clear();
        if self.data.state != DataState::Idle {
            debug!(seq = self.data.seq, "aborting outbound frame");
            self.data.state = DataState::Idle;
            handler.send_done(Err(FrameError::Aborted));
        }
    }

    /// True while an outbound data frame is queued, on the wire, or
    /// waiting for its ACK.
    pub fn is_sending(&self) -> bool {
        self.data.state != DataState::Idle
    }

    /// True while an inbound data frame is being received.
    pub fn is_receiving(&self) -> bool {
        self.rx.started
    }

    /// Engine counters.
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Sequence number state.
    pub fn sequence(&self) -> SequenceState {
        self.seq
    }

    /// Active configuration.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// The checksum strategy.
    pub fn checksum(&self) -> &C {
        &self.checksum
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        self.codec.transport()
    }

    /// Mutably borrow the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        self.codec.transport_mut()
    }

    /// Consume the engine and return the transport.
    pub fn into_transport(self) -> T {
        self.codec.into_inner()
    }

    // ---- receive ----

    fn on_delimiter<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) {
        let rx = std::mem::replace(&mut self.rx, RxFrame::new(RxState::Type));
        match rx.state {
            RxState::Idle | RxState::Type | RxState::Drain => {}
            RxState::Seq => self.lose_sync(&rx, handler),
            RxState::Payload => self.complete_frame(rx, handler),
        }
    }

    fn on_data<H: FrameHandler + ?Sized>(&mut self, byte: u8, handler: &mut H) {
        match self.rx.state {
            RxState::Idle | RxState::Drain => {}
            RxState::Type => match ProtocolByte::from_byte(byte) {
                Some(proto) => {
                    self.rx.proto = proto;
                    self.rx.state = RxState::Seq;
                }
                None => {
                    self.stats.unknown_protocol += 1;
                    trace!(byte, "unknown protocol byte; draining frame");
                    self.rx.state = RxState::Drain;
                }
            },
            RxState::Seq => {
                self.rx.seq = byte;
                self.rx.crc = self.checksum.update(self.checksum.init(), byte);
                self.rx.state = RxState::Payload;
                if !self.rx.proto.is_control() {
                    self.rx.started = true;
                    handler.receive_start(byte);
                }
            }
            RxState::Payload => {
                if self.rx.held_len < 2 {
                    self.rx.held[self.rx.held_len] = byte;
                    self.rx.held_len += 1;
                    return;
                }
                let released = self.rx.held[0];
                self.rx.held = [self.rx.held[1], byte];
                self.rx.crc = self.checksum.update(self.rx.crc, released);
                self.rx.payload_len += 1;
                if !self.rx.overflow
                    && (self.rx.proto.is_control() || !handler.receive_byte(released))
                {
                    self.rx.overflow = true;
                }
            }
        }
    }

    fn complete_frame<H: FrameHandler + ?Sized>(&mut self, rx: RxFrame, handler: &mut H) {
        let short = rx.held_len < 2
            || (rx.started
                && handler
                    .expected_len()
                    .is_some_and(|expected| rx.payload_len < expected));
        if short {
            self.lose_sync(&rx, handler);
            return;
        }

        let received = u16::from_le_bytes(rx.held);
        if received != rx.crc {
            self.stats.crc_errors += 1;
            debug!(
                seq = rx.seq,
                proto = rx.proto.name(),
                expected = rx.crc,
                actual = received,
                "crc mismatch"
            );
            if rx.proto == ProtocolByte::DataAcked {
                self.queue_ack(ProtocolByte::Nack, rx.seq);
            }
            let err = FrameError::Crc {
                expected: rx.crc,
                actual: received,
            };
            self.finish_rx(rx.started, Err(err), handler);
            self.start_next(handler);
            return;
        }

        match rx.proto {
            ProtocolByte::Ack | ProtocolByte::Nack => {
                if rx.overflow {
                    debug!(seq = rx.seq, "control frame with payload ignored");
                } else {
                    self.on_control(rx.proto, rx.seq, handler);
                }
            }
            ProtocolByte::Data => {
                let result = self.accept(&rx);
                self.finish_rx(true, result, handler);
            }
            ProtocolByte::DataAcked => {
                self.queue_ack(ProtocolByte::Ack, rx.seq);
                let result = if self.seq.last_received == Some(rx.seq) {
                    self.stats.duplicates += 1;
                    debug!(seq = rx.seq, "duplicate frame re-acknowledged");
                    Err(FrameError::Duplicate { seq: rx.seq })
                } else {
                    self.seq.last_received = Some(rx.seq);
                    self.accept(&rx)
                };
                self.finish_rx(true, result, handler);
                self.start_next(handler);
            }
        }
    }

    fn accept(&mut self, rx: &RxFrame) -> Result<()> {
        if rx.overflow {
            self.stats.overflows += 1;
            debug!(seq = rx.seq, len = rx.payload_len, "frame overflowed receive buffer");
            return Err(FrameError::Overflow);
        }
        self.stats.frames_received += 1;
        debug!(seq = rx.seq, len = rx.payload_len, "frame received");
        Ok(())
    }

    fn lose_sync<H: FrameHandler + ?Sized>(&mut self, rx: &RxFrame, handler: &mut H) {
        self.stats.loss_of_sync += 1;
        debug!(seq = rx.seq, len = rx.payload_len, "premature delimiter; frame dropped");
        self.finish_rx(rx.started, Err(FrameError::LossOfSync), handler);
    }

    fn finish_rx<H: FrameHandler + ?Sized>(
        &mut self,
        started: bool,
        result: Result<()>,
        handler: &mut H,
    ) {
        if started {
            handler.receive_done(result);
        }
    }

    fn on_control<H: FrameHandler + ?Sized>(
        &mut self,
        proto: ProtocolByte,
        seq: u8,
        handler: &mut H,
    ) {
        if self.data.seq != seq || self.data.proto != ProtocolByte::DataAcked {
            debug!(seq, proto = proto.name(), "stale control frame ignored");
            return;
        }
        match self.data.state {
            DataState::AwaitAck(_) => match proto {
                ProtocolByte::Ack => self.complete_send(handler),
                _ => {
                    debug!(seq, "nack received");
                    self.retransmit(handler);
                }
            },
            DataState::OnWire if self.is_closing() => {
                // Reply overtook the completion of our closing delimiter.
                self.data.early_reply = Some(proto);
            }
            _ => debug!(seq, proto = proto.name(), "unexpected control frame ignored"),
        }
    }

    fn queue_ack(&mut self, proto: ProtocolByte, seq: u8) {
        if self.acks.len() >= self.config.ack_queue_depth {
            self.stats.dropped_acks += 1;
            warn!(seq, proto = proto.name(), "ack queue full; dropping");
            return;
        }
        self.acks.push_back(PendingAck { proto, seq });
    }

    // ---- send ----

    fn is_closing(&self) -> bool {
        matches!(
            self.line,
            Some(Line {
                frame: LineFrame::Data,
                stage: Stage::Close,
                ..
            })
        )
    }

    /// Start the next frame if the line is free: queued ACKs first, then a
    /// pending data frame.
    fn start_next<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) {
        if self.line.is_some() || self.codec.is_sending() {
            return;
        }
        let frame = if let Some(ack) = self.acks.pop_front() {
            LineFrame::Control {
                proto: ack.proto,
                seq: ack.seq,
            }
        } else if self.data.state == DataState::Pending {
            self.data.attempts += 1;
            self.data.state = DataState::OnWire;
            self.data.early_reply = None;
            if self.data.attempts > 1 {
                handler.rewind_send();
            }
            self.window.clear();
            self.payload_ended = false;
            self.refill(handler);
            LineFrame::Data
        } else {
            return;
        };

        trace!(?frame, "frame start");
        self.line = Some(Line {
            frame,
            stage: Stage::Open,
            crc: self.checksum.init(),
        });
        self.emit(handler);
    }

    fn refill<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) {
        while !self.payload_ended && self.window.len() < self.config.lookahead {
            match handler.next_send_byte() {
                Some(byte) => self.window.push_back(byte),
                None => self.payload_ended = true,
            }
        }
    }

    fn header(&self, frame: LineFrame) -> (ProtocolByte, u8) {
        match frame {
            LineFrame::Data => (self.data.proto, self.data.seq),
            LineFrame::Control { proto, seq } => (proto, seq),
        }
    }

    fn emit<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) {
        let Some(line) = self.line else {
            return;
        };
        let (proto, seq) = self.header(line.frame);
        let [crc_lo, crc_hi] = line.crc.to_le_bytes();
        let result = match line.stage {
            Stage::Open | Stage::Close => self.codec.send_delimiter(),
            Stage::Proto => self.codec.send_data(proto.as_byte()),
            Stage::Seq => self.codec.send_data(seq),
            Stage::Payload(byte) => self.codec.send_data(byte),
            Stage::CrcLo => self.codec.send_data(crc_lo),
            Stage::CrcHi => self.codec.send_data(crc_hi),
        };
        if let Err(err) = result {
            self.fail_line(err.into(), handler);
        }
    }

    fn on_send_done<H: FrameHandler + ?Sized>(
        &mut self,
        result: std::result::Result<(), TransportError>,
        handler: &mut H,
    ) {
        let Some(line) = self.line else {
            trace!("completion for an aborted frame");
            self.start_next(handler);
            return;
        };
        if let Err(err) = result {
            self.fail_line(err.into(), handler);
            return;
        }

        let (_, seq) = self.header(line.frame);
        let mut crc = line.crc;
        let next = match line.stage {
            Stage::Open => Stage::Proto,
            Stage::Proto => {
                crc = self.checksum.update(crc, seq);
                Stage::Seq
            }
            Stage::Seq | Stage::Payload(_) => match line.frame {
                LineFrame::Control { .. } => Stage::CrcLo,
                LineFrame::Data => {
                    let next = self.window.pop_front();
                    self.refill(handler);
                    match next {
                        Some(byte) => {
                            crc = self.checksum.update(crc, byte);
                            Stage::Payload(byte)
                        }
                        None => Stage::CrcLo,
                    }
                }
            },
            Stage::CrcLo => Stage::CrcHi,
            Stage::CrcHi => Stage::Close,
            Stage::Close => {
                self.line = None;
                self.frame_finished(line.frame, handler);
                self.start_next(handler);
                return;
            }
        };

        self.line = Some(Line {
            stage: next,
            crc,
            ..line
        });
        self.emit(handler);
    }

    fn frame_finished<H: FrameHandler + ?Sized>(&mut self, frame: LineFrame, handler: &mut H) {
        match frame {
            LineFrame::Control { proto, seq } => {
                if proto == ProtocolByte::Ack {
                    self.stats.acks_sent += 1;
                } else {
                    self.stats.nacks_sent += 1;
                }
                trace!(seq, proto = proto.name(), "control frame sent");
            }
            LineFrame::Data if self.data.proto == ProtocolByte::DataAcked => {
                match self.data.early_reply.take() {
                    Some(ProtocolByte::Ack) => self.complete_send(handler),
                    Some(_) => self.retransmit(handler),
                    None => {
                        let deadline = Instant::now() + self.config.ack_timeout;
                        self.data.state = DataState::AwaitAck(deadline);
                        trace!(seq = self.data.seq, "awaiting ack");
                    }
                }
            }
            LineFrame::Data => self.complete_send(handler),
        }
    }

    fn complete_send<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) {
        let seq = self.data.seq;
        if self.data.proto == ProtocolByte::DataAcked {
            self.seq.last_acked = Some(seq);
        }
        self.data.state = DataState::Idle;
        self.stats.frames_sent += 1;
        debug!(seq, attempts = self.data.attempts, "frame sent");
        handler.send_done(Ok(()));
        self.start_next(handler);
    }

    fn retransmit<H: FrameHandler + ?Sized>(&mut self, handler: &mut H) {
        let seq = self.data.seq;
        let attempts = self.data.attempts;
        if attempts > u16::from(self.config.max_retries) {
            warn!(seq, attempts, "no acknowledgment; giving up");
            self.data.state = DataState::Idle;
            handler.send_done(Err(FrameError::AckTimeout { attempts }));
            self.start_next(handler);
            return;
        }
        self.stats.retransmissions += 1;
        debug!(seq, attempt = attempts + 1, "retransmitting");
        self.data.state = DataState::Pending;
        self.start_next(handler);
    }

    fn fail_line<H: FrameHandler + ?Sized>(&mut self, err: FrameError, handler: &mut H) {
        let Some(line) = self.line.take() else {
            return;
        };
        self.codec.reset_send();
        match line.frame {
            LineFrame::Control { proto, seq } => {
                debug!(seq, proto = proto.name(), error = %err, "control frame send failed");
            }
            LineFrame::Data => {
                debug!(seq = self.data.seq, error = %err, "data frame send failed");
                self.data.state = DataState::Idle;
                handler.send_done(Err(err));
            }
        }
        self.start_next(handler);
    }
}

impl<T, C> std::fmt::Debug for ProtocolEngine<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("rx_state", &self.rx.state)
            .field("data_state", &self.data.state)
            .field("line", &self.line)
            .field("pending_acks", &self.acks.len())
            .field("sequence", &self.seq)
            .finish()
    }
}
