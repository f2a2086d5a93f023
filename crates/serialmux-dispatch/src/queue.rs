use serialmux_frame::Checksum;
use serialmux_transport::ByteTransport;
use tracing::{debug, trace};

use crate::buffer::PacketBuffer;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Rejected};

/// A queued send that the dispatcher refused when its turn came.
#[derive(Debug, thiserror::Error)]
#[error("client {client}: {rejected}")]
pub struct QueueError {
    pub client: usize,
    #[source]
    pub rejected: Rejected,
}

struct Pending {
    format: u8,
    buffer: PacketBuffer,
    len: usize,
}

/// Fair-share arbitration of one dispatcher among several clients.
///
/// Each client owns one slot. A client's slot stays occupied from
/// [`submit`](Self::submit) until its packet has left the dispatcher, so a
/// client never has more than one packet outstanding. Slots are served
/// round-robin starting after the client served last.
pub struct SendQueue {
    slots: Vec<Option<Pending>>,
    in_flight: Option<usize>,
    next: usize,
}

impl SendQueue {
    /// Create a queue with one slot per client id in `0..clients`.
    pub fn new(clients: usize) -> Self {
        Self {
            slots: (0..clients).map(|_| None).collect(),
            in_flight: None,
            next: 0,
        }
    }

    pub fn clients(&self) -> usize {
        self.slots.len()
    }

    /// Queue a packet for `client`.
    ///
    /// Fails with [`DispatchError::Busy`] while the client's previous packet
    /// is queued or in flight. The buffer is returned on failure.
    pub fn submit(
        &mut self,
        client: usize,
        format: u8,
        buffer: PacketBuffer,
        len: usize,
    ) -> std::result::Result<(), Rejected> {
        if client >= self.slots.len() {
            return Err(Rejected::new(DispatchError::UnknownClient(client), buffer));
        }
        if self.is_pending(client) {
            return Err(Rejected::new(DispatchError::Busy, buffer));
        }
        self.slots[client] = Some(Pending {
            format,
            buffer,
            len,
        });
        trace!(client, format, len, "send queued");
        Ok(())
    }

    /// Like [`submit`](Self::submit), but first checks the request against
    /// the dispatcher so an invalid packet is refused now rather than when
    /// its turn comes.
    pub fn submit_checked<T: ByteTransport, C: Checksum>(
        &mut self,
        dispatcher: &Dispatcher<T, C>,
        client: usize,
        format: u8,
        buffer: PacketBuffer,
        len: usize,
    ) -> std::result::Result<(), Rejected> {
        if let Err(err) = dispatcher.validate(format, &buffer, len) {
            return Err(Rejected::new(err, buffer));
        }
        self.submit(client, format, buffer, len)
    }

    /// True while `client` has a packet queued or in flight.
    pub fn is_pending(&self, client: usize) -> bool {
        self.in_flight == Some(client) || matches!(self.slots.get(client), Some(Some(_)))
    }

    /// Remove a queued packet that has not started yet.
    pub fn cancel(&mut self, client: usize) -> Option<PacketBuffer> {
        self.slots
            .get_mut(client)
            .and_then(Option::take)
            .map(|pending| pending.buffer)
    }

    /// Start the next queued packet if the dispatcher is idle.
    ///
    /// Call after every event handled by the dispatcher. Returns the client
    /// whose packet started, if any.
    pub fn pump<T: ByteTransport, C: Checksum>(
        &mut self,
        dispatcher: &mut Dispatcher<T, C>,
    ) -> std::result::Result<Option<usize>, QueueError> {
        if dispatcher.is_sending() {
            return Ok(None);
        }
        if let Some(client) = self.in_flight.take() {
            trace!(client, "client slot released");
        }

        let clients = self.slots.len();
        for step in 0..clients {
            let client = (self.next + step) % clients;
            let Some(pending) = self.slots[client].take() else {
                continue;
            };
            self.next = (client + 1) % clients;
            return match dispatcher.send(pending.format, pending.buffer, pending.len) {
                Ok(()) => {
                    // A synchronous failure already completed the send.
                    if dispatcher.is_sending() {
                        self.in_flight = Some(client);
                    }
                    debug!(client, format = pending.format, "queued send started");
                    Ok(Some(client))
                }
                Err(rejected) => Err(QueueError { client, rejected }),
            };
        }
        Ok(None)
    }
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queued: Vec<usize> = (0..self.slots.len())
            .filter(|&client| self.slots[client].is_some())
            .collect();
        f.debug_struct("SendQueue")
            .field("clients", &self.slots.len())
            .field("queued", &queued)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::BytesMut;
    use serialmux_frame::{encode_frame, Crc16Xmodem, ProtocolByte, ProtocolConfig};
    use serialmux_transport::{MemoryLink, MemoryTransport};

    use super::*;
    use crate::am::AmHeader;
    use crate::dispatcher::{Delivery, DispatcherConfig, PacketHandler};
    use crate::error::Result;
    use crate::format::{ActiveMessageFormat, RawFormat, FORMAT_ACTIVE_MESSAGE};

    const RAW: u8 = 0x07;

    #[derive(Clone, Default)]
    struct Completions(Rc<RefCell<Vec<(u8, Vec<u8>)>>>);

    impl PacketHandler for Completions {
        fn received(&mut self, _delivery: &mut Delivery<'_>) {}

        fn send_done(&mut self, format: u8, buffer: PacketBuffer, result: Result<()>) {
            assert!(result.is_ok());
            self.0.borrow_mut().push((format, buffer.payload().to_vec()));
        }
    }

    fn setup() -> (Dispatcher<MemoryTransport>, MemoryLink, Completions) {
        let (transport, link) = MemoryTransport::new();
        let mut dispatcher = Dispatcher::with_config(
            transport,
            ProtocolConfig::device(),
            DispatcherConfig::default(),
        );
        let done = Completions::default();
        dispatcher
            .register(FORMAT_ACTIVE_MESSAGE, ActiveMessageFormat, done.clone())
            .unwrap();
        dispatcher.register(RAW, RawFormat, done.clone()).unwrap();
        (dispatcher, link, done)
    }

    fn run(queue: &mut SendQueue, dispatcher: &mut Dispatcher<MemoryTransport>) {
        loop {
            let started = queue.pump(dispatcher).unwrap();
            if dispatcher.process_pending() == 0 && started.is_none() {
                break;
            }
        }
    }

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        encode_frame(&Crc16Xmodem, ProtocolByte::Data, seq, payload, &mut wire);
        wire.to_vec()
    }

    #[test]
    fn sends_for_different_formats_never_interleave() {
        let (mut dispatcher, link, done) = setup();
        let mut queue = SendQueue::new(2);

        let mut am = dispatcher.new_buffer();
        let am_len =
            ActiveMessageFormat::prepare(&mut am, AmHeader::new(0x0001, 0x22, 3), &[0x7E, 0x10])
                .unwrap();
        let mut raw = dispatcher.new_buffer();
        raw.set_payload(&[0xA0, 0xA1, 0xA2]).unwrap();

        queue.submit(0, FORMAT_ACTIVE_MESSAGE, am, am_len).unwrap();
        queue.submit(1, RAW, raw, 3).unwrap();
        assert_eq!(queue.pump(&mut dispatcher).unwrap(), Some(0));
        // Second client waits while the first packet is on the wire.
        assert_eq!(queue.pump(&mut dispatcher).unwrap(), None);
        run(&mut queue, &mut dispatcher);

        let mut expected = frame(0, &[0x00, 0x00, 0x01, 0x02, 0x22, 0x03, 0x7E, 0x10]);
        expected.extend(frame(1, &[RAW, 0xA0, 0xA1, 0xA2]));
        assert_eq!(link.take_sent(), expected);
        assert_eq!(
            *done.0.borrow(),
            vec![
                (FORMAT_ACTIVE_MESSAGE, vec![0x7E, 0x10]),
                (RAW, vec![0xA0, 0xA1, 0xA2])
            ]
        );
        assert!(!queue.is_pending(0));
        assert!(!queue.is_pending(1));
    }

    #[test]
    fn one_slot_per_client() {
        let (dispatcher, _link, _done) = setup();
        let mut queue = SendQueue::new(1);

        queue
            .submit(0, RAW, dispatcher.new_buffer(), 0)
            .unwrap();
        let rejected = queue
            .submit(0, RAW, dispatcher.new_buffer(), 0)
            .unwrap_err();
        assert!(matches!(rejected.error, DispatchError::Busy));

        let rejected = queue
            .submit(4, RAW, dispatcher.new_buffer(), 0)
            .unwrap_err();
        assert!(matches!(rejected.error, DispatchError::UnknownClient(4)));
    }

    #[test]
    fn slot_stays_busy_until_packet_leaves() {
        let (mut dispatcher, _link, _done) = setup();
        let mut queue = SendQueue::new(1);

        queue.submit(0, RAW, dispatcher.new_buffer(), 0).unwrap();
        assert_eq!(queue.pump(&mut dispatcher).unwrap(), Some(0));
        assert!(queue.is_pending(0));
        assert!(queue.submit(0, RAW, dispatcher.new_buffer(), 0).is_err());

        run(&mut queue, &mut dispatcher);
        assert!(!queue.is_pending(0));
        queue.submit(0, RAW, dispatcher.new_buffer(), 0).unwrap();
    }

    #[test]
    fn clients_are_served_round_robin() {
        let (mut dispatcher, link, _done) = setup();
        let mut queue = SendQueue::new(3);

        for client in [2, 0, 1] {
            let mut buffer = dispatcher.new_buffer();
            buffer.set_payload(&[client as u8]).unwrap();
            queue.submit(client, RAW, buffer, 1).unwrap();
        }
        run(&mut queue, &mut dispatcher);

        let mut expected = frame(0, &[RAW, 0]);
        expected.extend(frame(1, &[RAW, 1]));
        expected.extend(frame(2, &[RAW, 2]));
        assert_eq!(link.take_sent(), expected);
    }

    #[test]
    fn cancel_returns_queued_buffer() {
        let (dispatcher, _link, _done) = setup();
        let mut queue = SendQueue::new(2);
        let mut buffer = dispatcher.new_buffer();
        buffer.set_payload(&[5]).unwrap();
        queue.submit(1, RAW, buffer, 1).unwrap();

        let buffer = queue.cancel(1).unwrap();
        assert_eq!(buffer.payload(), &[5]);
        assert!(!queue.is_pending(1));
        assert!(queue.cancel(1).is_none());
    }

    #[test]
    fn invalid_request_is_refused_before_queueing() {
        let (dispatcher, _link, _done) = setup();
        let mut queue = SendQueue::new(1);

        let rejected = queue
            .submit_checked(&dispatcher, 0, 0x42, dispatcher.new_buffer(), 1)
            .unwrap_err();
        assert!(matches!(rejected.error, DispatchError::UnknownFormat(0x42)));
        assert!(!queue.is_pending(0));
    }
}
