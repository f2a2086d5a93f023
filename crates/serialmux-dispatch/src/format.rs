//! Packet formats multiplexed over one link.
//!
//! The first payload byte of every data frame is a format id. A
//! [`FormatDescriptor`] tells the dispatcher where that format's bytes go in
//! a [`PacketBuffer`](crate::PacketBuffer) and how its upper-layer length
//! maps to the number of bytes on the wire.

/// Reserved id meaning "no registered format". Never registered; frames
/// carrying it are drained without delivery.
pub const FORMAT_UNKNOWN: u8 = 0xFF;

/// Format id of [`ActiveMessageFormat`].
pub const FORMAT_ACTIVE_MESSAGE: u8 = 0x00;

/// Per-format layout and length translation.
///
/// `data_link_length` and `upper_length` must be inverses over every valid
/// length. The data-link length counts the bytes that follow the format id
/// on the wire.
pub trait FormatDescriptor {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Size of the header that precedes the data region.
    fn header_len(&self) -> usize;

    /// Where this format's bytes start in a buffer with the given reserve.
    fn offset(&self, header_reserve: usize) -> usize {
        header_reserve.saturating_sub(self.header_len())
    }

    /// On-wire length for an upper-layer length, `None` if out of range.
    fn data_link_length(&self, upper: usize) -> Option<usize>;

    /// Upper-layer length for an on-wire length, `None` if out of range.
    fn upper_length(&self, data_link: usize) -> Option<usize>;

    /// Data-link length announced by a partially received packet, once the
    /// bytes received so far (starting at the offset) determine it.
    fn expected_length(&self, received: &[u8]) -> Option<usize> {
        let _ = received;
        None
    }
}

impl<F: FormatDescriptor + ?Sized> FormatDescriptor for Box<F> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn header_len(&self) -> usize {
        (**self).header_len()
    }

    fn offset(&self, header_reserve: usize) -> usize {
        (**self).offset(header_reserve)
    }

    fn data_link_length(&self, upper: usize) -> Option<usize> {
        (**self).data_link_length(upper)
    }

    fn upper_length(&self, data_link: usize) -> Option<usize> {
        (**self).upper_length(data_link)
    }

    fn expected_length(&self, received: &[u8]) -> Option<usize> {
        (**self).expected_length(received)
    }
}

/// Active message packets: a 5-byte header followed by up to 255 data bytes.
///
/// Header layout: `dest: u16 (big endian), length: u8, group: u8,
/// am_type: u8`. The length field holds the data length.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveMessageFormat;

impl ActiveMessageFormat {
    pub const HEADER_LEN: usize = 5;

    /// Offset of the length field within the header.
    pub(crate) const LENGTH_FIELD: usize = 2;

    pub const MAX_DATA_LEN: usize = u8::MAX as usize;
}

impl FormatDescriptor for ActiveMessageFormat {
    fn name(&self) -> &'static str {
        "active-message"
    }

    fn header_len(&self) -> usize {
        Self::HEADER_LEN
    }

    fn data_link_length(&self, upper: usize) -> Option<usize> {
        (upper <= Self::MAX_DATA_LEN).then_some(upper + Self::HEADER_LEN)
    }

    fn upper_length(&self, data_link: usize) -> Option<usize> {
        data_link
            .checked_sub(Self::HEADER_LEN)
            .filter(|&upper| upper <= Self::MAX_DATA_LEN)
    }

    fn expected_length(&self, received: &[u8]) -> Option<usize> {
        received
            .get(Self::LENGTH_FIELD)
            .map(|&len| usize::from(len) + Self::HEADER_LEN)
    }
}

/// Headerless packets: the payload goes on the wire as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFormat;

impl FormatDescriptor for RawFormat {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn header_len(&self) -> usize {
        0
    }

    fn data_link_length(&self, upper: usize) -> Option<usize> {
        Some(upper)
    }

    fn upper_length(&self, data_link: usize) -> Option<usize> {
        Some(data_link)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn active_message_header_sits_before_data_region() {
        assert_eq!(ActiveMessageFormat.offset(8), 3);
        assert_eq!(ActiveMessageFormat.offset(5), 0);
        assert_eq!(RawFormat.offset(8), 8);
    }

    #[test]
    fn active_message_length_limits() {
        assert_eq!(ActiveMessageFormat.data_link_length(0), Some(5));
        assert_eq!(ActiveMessageFormat.data_link_length(255), Some(260));
        assert_eq!(ActiveMessageFormat.data_link_length(256), None);
        assert_eq!(ActiveMessageFormat.upper_length(4), None);
        assert_eq!(ActiveMessageFormat.upper_length(261), None);
    }

    #[test]
    fn active_message_expected_length_needs_length_field() {
        assert_eq!(ActiveMessageFormat.expected_length(&[0xBE, 0xEF]), None);
        assert_eq!(ActiveMessageFormat.expected_length(&[0xBE, 0xEF, 5]), Some(10));
        assert_eq!(RawFormat.expected_length(&[1, 2, 3]), None);
    }

    #[test]
    fn boxed_descriptor_delegates() {
        let boxed: Box<dyn FormatDescriptor> = Box::new(ActiveMessageFormat);
        assert_eq!(boxed.name(), "active-message");
        assert_eq!(boxed.offset(8), 3);
        assert_eq!(boxed.expected_length(&[0, 0, 1]), Some(6));
    }

    proptest! {
        #[test]
        fn active_message_lengths_are_inverse(len in 0usize..=255) {
            let wire = ActiveMessageFormat.data_link_length(len).unwrap();
            prop_assert_eq!(ActiveMessageFormat.upper_length(wire), Some(len));
        }

        #[test]
        fn raw_lengths_are_inverse(len in 0usize..100_000) {
            let wire = RawFormat.data_link_length(len).unwrap();
            prop_assert_eq!(RawFormat.upper_length(wire), Some(len));
        }
    }
}
