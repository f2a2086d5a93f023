use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{ByteTransport, TransportEvent};

type Line = Rc<RefCell<VecDeque<u8>>>;

#[derive(Debug, Default)]
struct Faults {
    fail_puts: usize,
    fail_flushes: usize,
}

/// In-process serial line.
///
/// Every `put` completes immediately: the byte is appended to the outbound
/// line and a `PutDone` is queued. Completions are delivered by
/// [`poll_event`](ByteTransport::poll_event) before any inbound byte, which
/// mirrors a UART whose transmit interrupt has priority over receive.
///
/// Single-threaded by construction (`Rc`), matching the one execution context
/// the protocol stack runs in.
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: Line,
    inbound: Line,
    faults: Rc<RefCell<Faults>>,
    completions: VecDeque<TransportEvent>,
    put_in_flight: bool,
}

/// Test-side handle onto a [`MemoryTransport`]'s line.
#[derive(Debug, Clone)]
pub struct MemoryLink {
    outbound: Line,
    inbound: Line,
    faults: Rc<RefCell<Faults>>,
}

impl MemoryTransport {
    /// Create a standalone transport and the link handle that observes it.
    pub fn new() -> (Self, MemoryLink) {
        let transport = Self::with_lines(Line::default(), Line::default());
        let link = transport.link();
        (transport, link)
    }

    /// Create two transports wired back-to-back: bytes put on one are
    /// received by the other.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Line::default();
        let b_to_a = Line::default();
        let a = Self::with_lines(Rc::clone(&a_to_b), Rc::clone(&b_to_a));
        let b = Self::with_lines(b_to_a, a_to_b);
        (a, b)
    }

    fn with_lines(outbound: Line, inbound: Line) -> Self {
        Self {
            outbound,
            inbound,
            faults: Rc::default(),
            completions: VecDeque::new(),
            put_in_flight: false,
        }
    }

    /// A handle onto this transport's line.
    pub fn link(&self) -> MemoryLink {
        MemoryLink {
            outbound: Rc::clone(&self.outbound),
            inbound: Rc::clone(&self.inbound),
            faults: Rc::clone(&self.faults),
        }
    }
}

impl ByteTransport for MemoryTransport {
    fn put(&mut self, byte: u8) -> Result<()> {
        if self.put_in_flight {
            return Err(TransportError::Busy);
        }
        self.put_in_flight = true;

        let mut faults = self.faults.borrow_mut();
        if faults.fail_puts > 0 {
            faults.fail_puts -= 1;
            trace!(byte, "injected put failure");
            self.completions
                .push_back(TransportEvent::PutDone(Err(TransportError::Fault(
                    "injected put failure".to_string(),
                ))));
            return Ok(());
        }

        self.outbound.borrow_mut().push_back(byte);
        self.completions.push_back(TransportEvent::PutDone(Ok(())));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut faults = self.faults.borrow_mut();
        let result = if faults.fail_flushes > 0 {
            faults.fail_flushes -= 1;
            Err(TransportError::Fault("injected flush failure".to_string()))
        } else {
            Ok(())
        };
        self.completions.push_back(TransportEvent::FlushDone(result));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.completions.pop_front() {
            if matches!(event, TransportEvent::PutDone(_)) {
                self.put_in_flight = false;
            }
            return Some(event);
        }
        self.inbound
            .borrow_mut()
            .pop_front()
            .map(TransportEvent::ByteReceived)
    }
}

impl MemoryLink {
    /// Queue bytes as if they had arrived on the line.
    pub fn inject(&self, bytes: &[u8]) {
        self.inbound.borrow_mut().extend(bytes.iter().copied());
    }

    /// Remove and return everything the transport has transmitted so far.
    pub fn take_sent(&self) -> Vec<u8> {
        self.outbound.borrow_mut().drain(..).collect()
    }

    /// Number of transmitted bytes not yet taken.
    pub fn sent_len(&self) -> usize {
        self.outbound.borrow().len()
    }

    /// Number of inbound bytes not yet consumed by the transport.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.borrow().len()
    }

    /// Make the next `count` puts complete with a fault.
    pub fn fail_puts(&self, count: usize) {
        self.faults.borrow_mut().fail_puts += count;
    }

    /// Make the next `count` flushes complete with a fault.
    pub fn fail_flushes(&self, count: usize) {
        self.faults.borrow_mut().fail_flushes += count;
    }
}
