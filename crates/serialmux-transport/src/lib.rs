//! Byte transport seam for serialmux.
//!
//! Everything above this crate talks to the serial line through the
//! [`ByteTransport`] trait: a non-blocking single-byte `put`, a `flush`
//! request for transmit-idle detection, and a stream of [`TransportEvent`]s
//! (byte received, put done, flush done).
//!
//! Provided implementations:
//! - [`MemoryTransport`] for in-process links and tests
//! - [`IoTransport`] over any `std::io::Read` + `std::io::Write` pair
//! - `QueuedTransport` and [`queue::event_queue`] (behind the `async` feature)
//!   for serializing events produced on several threads onto one queue

pub mod error;
pub mod io;
pub mod memory;
#[cfg(feature = "async")]
pub mod queue;
pub mod traits;

pub use error::{Result, TransportError};
pub use io::IoTransport;
pub use memory::{MemoryLink, MemoryTransport};
#[cfg(feature = "async")]
pub use queue::{event_queue, EventQueue, EventSender, QueuedTransport};
pub use traits::{ByteTransport, TransportEvent};
