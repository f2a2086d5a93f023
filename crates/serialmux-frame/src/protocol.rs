//! Reserved wire bytes and protocol byte values.
//!
//! Every frame on the wire looks like:
//!
//! ```text
//! ┌───────┬───────┬─────┬───────────────────┬────────┬────────┬───────┐
//! │ DELIM │ PROTO │ SEQ │ payload (escaped) │ CRC_LO │ CRC_HI │ DELIM │
//! │ 0x7E  │       │     │                   │        │        │ 0x7E  │
//! └───────┴───────┴─────┴───────────────────┴────────┴────────┴───────┘
//! ```
//!
//! The CRC covers SEQ through the last payload byte. Control frames (ACK,
//! NACK) carry no payload.

/// Frame delimiter.
pub const DELIMITER: u8 = 0x7E;

/// Escape byte; the byte after it is transmitted XOR [`ESCAPE_XOR`].
pub const ESCAPE: u8 = 0x7D;

/// Value XORed into an escaped byte.
pub const ESCAPE_XOR: u8 = 0x20;

/// Data frame the receiver must acknowledge.
pub const PROTO_DATA_ACKED: u8 = 0x40;

/// Positive acknowledgment.
pub const PROTO_ACK: u8 = 0x43;

/// Negative acknowledgment (checksum failed).
pub const PROTO_NACK: u8 = 0x44;

/// Best-effort data frame, never acknowledged.
pub const PROTO_DATA: u8 = 0x45;

/// Returns true if `byte` has to be escaped inside a frame.
pub fn needs_escape(byte: u8) -> bool {
    byte == DELIMITER || byte == ESCAPE
}

/// Decoded protocol byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolByte {
    /// Data, acknowledgment requested.
    DataAcked,
    /// Data, best effort.
    Data,
    /// Acknowledgment of a `DataAcked` frame.
    Ack,
    /// Negative acknowledgment of a `DataAcked` frame.
    Nack,
}

impl ProtocolByte {
    /// Parse a protocol byte. Returns `None` for unknown values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            PROTO_DATA_ACKED => Some(Self::DataAcked),
            PROTO_DATA => Some(Self::Data),
            PROTO_ACK => Some(Self::Ack),
            PROTO_NACK => Some(Self::Nack),
            _ => None,
        }
    }

    /// The wire value.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::DataAcked => PROTO_DATA_ACKED,
            Self::Data => PROTO_DATA,
            Self::Ack => PROTO_ACK,
            Self::Nack => PROTO_NACK,
        }
    }

    /// True for ACK/NACK.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Ack | Self::Nack)
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::DataAcked => "DATA_ACKED",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_bytes_round_trip() {
        for proto in [
            ProtocolByte::DataAcked,
            ProtocolByte::Data,
            ProtocolByte::Ack,
            ProtocolByte::Nack,
        ] {
            assert_eq!(ProtocolByte::from_byte(proto.as_byte()), Some(proto));
        }
        assert_eq!(ProtocolByte::from_byte(0x00), None);
    }

    #[test]
    fn protocol_bytes_never_need_escaping() {
        for byte in [PROTO_DATA_ACKED, PROTO_DATA, PROTO_ACK, PROTO_NACK] {
            assert!(!needs_escape(byte));
        }
    }

    #[test]
    fn control_classification() {
        assert!(ProtocolByte::Ack.is_control());
        assert!(ProtocolByte::Nack.is_control());
        assert!(!ProtocolByte::Data.is_control());
        assert!(!ProtocolByte::DataAcked.is_control());
    }
}
