//! Checksummed, multiplexed packet channel over a raw serial line.
//!
//! serialmux turns an unreliable byte-at-a-time link into framed, CRC-checked
//! packets, acknowledges one direction with stop-and-wait retransmission,
//! and multiplexes several packet formats over the same wire.
//!
//! # Crate Structure
//!
//! - [`transport`]: Byte transport seam (in-memory, `std::io`, async event queue)
//! - [`frame`]: Byte stuffing, CRC and the frame-level protocol engine
//! - [`dispatch`]: Packet formats, buffers and dispatch (behind `dispatch` feature)

/// Re-export transport types.
pub mod transport {
    pub use serialmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use serialmux_frame::*;
}

/// Re-export dispatch types (requires `dispatch` feature).
#[cfg(feature = "dispatch")]
pub mod dispatch {
    pub use serialmux_dispatch::*;
}
