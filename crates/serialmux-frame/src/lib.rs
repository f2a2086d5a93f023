//! Byte-stuffed, CRC-checked framing for serial links.
//!
//! Two layers sit on top of a [`serialmux_transport::ByteTransport`]:
//!
//! - [`FrameCodec`] escapes and unescapes bytes. `0x7E` delimits frames and
//!   `0x7D` escapes a following byte XOR `0x20`.
//! - [`ProtocolEngine`] builds frames on the wire as
//!   `7E PROTO SEQ payload CRC_LO CRC_HI 7E`, verifies the CRC of inbound
//!   frames, and runs stop-and-wait acknowledgment for `DATA_ACKED` frames.
//!
//! Both layers are event driven and never block. Payload bytes flow to and
//! from the layer above through the [`FrameHandler`] trait.

pub mod codec;
pub mod config;
pub mod crc;
pub mod engine;
pub mod error;
pub mod protocol;

pub use codec::{encode_frame, CodecEvent, FrameCodec};
pub use config::{
    OutboundMode, ProtocolConfig, DEFAULT_ACK_QUEUE_DEPTH, DEFAULT_ACK_TIMEOUT, DEFAULT_LOOKAHEAD,
    DEFAULT_MAX_RETRIES, MAX_LOOKAHEAD,
};
pub use crc::{Checksum, Crc16Modbus, Crc16Xmodem};
pub use engine::{EngineStats, FrameHandler, ProtocolEngine, SequenceState};
pub use error::{FrameError, Result};
pub use protocol::{
    ProtocolByte, DELIMITER, ESCAPE, ESCAPE_XOR, PROTO_ACK, PROTO_DATA, PROTO_DATA_ACKED, PROTO_NACK,
};
