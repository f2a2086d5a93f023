//! Multi-format packet dispatch over a framed serial link.
//!
//! The first payload byte of every frame selects a packet format. The
//! [`Dispatcher`] owns one reusable [`PacketBuffer`] per direction, routes
//! received packets to the [`PacketHandler`] registered for their format,
//! and streams outgoing packets into the protocol engine one at a time.
//!
//! [`SendQueue`] arbitrates between several clients sharing the single
//! outgoing slot.

pub mod am;
pub mod buffer;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod queue;
pub mod registry;

pub use am::{AmHeader, AM_BROADCAST};
pub use buffer::{PacketBuffer, DEFAULT_DATA_CAPACITY, DEFAULT_HEADER_RESERVE};
pub use dispatcher::{Delivery, DispatchStats, Dispatcher, DispatcherConfig, PacketHandler};
pub use error::{DispatchError, Rejected, Result};
pub use format::{
    ActiveMessageFormat, FormatDescriptor, RawFormat, FORMAT_ACTIVE_MESSAGE, FORMAT_UNKNOWN,
};
pub use queue::{QueueError, SendQueue};
pub use registry::FormatRegistry;
