use crate::error::{DispatchError, Result};
use crate::format::FORMAT_UNKNOWN;

/// Default bytes reserved in front of the data region for format headers.
pub const DEFAULT_HEADER_RESERVE: usize = 8;

/// Default size of the data region.
pub const DEFAULT_DATA_CAPACITY: usize = 120;

/// Fixed-capacity storage for one packet.
///
/// Layout: `[header reserve][data region]`. A format's header ends exactly
/// where the data region begins, so a header of `n` bytes starts at
/// `header_reserve - n`. Storage is allocated once and never resized.
pub struct PacketBuffer {
    storage: Box<[u8]>,
    header_reserve: usize,
    format: u8,
    fill: usize,
    len: usize,
}

impl PacketBuffer {
    /// Allocate a buffer with the given geometry.
    pub fn new(header_reserve: usize, data_capacity: usize) -> Self {
        Self {
            storage: vec![0; header_reserve + data_capacity].into_boxed_slice(),
            header_reserve,
            format: FORMAT_UNKNOWN,
            fill: 0,
            len: 0,
        }
    }

    /// Bytes reserved in front of the data region.
    pub fn header_reserve(&self) -> usize {
        self.header_reserve
    }

    /// Size of the data region.
    pub fn capacity(&self) -> usize {
        self.storage.len() - self.header_reserve
    }

    /// Total size, header reserve included.
    pub fn total_len(&self) -> usize {
        self.storage.len()
    }

    /// Format id of the packet held, [`FORMAT_UNKNOWN`] if none.
    pub fn format(&self) -> u8 {
        self.format
    }

    /// Declared payload length (bytes used in the data region).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// End of the bytes written by the last reception, as an absolute index.
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// The declared payload.
    pub fn payload(&self) -> &[u8] {
        &self.storage[self.header_reserve..self.header_reserve + self.len]
    }

    /// The whole data region, for filling in place. Follow with
    /// [`set_len`](Self::set_len).
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.header_reserve..]
    }

    /// Declare how many bytes of the data region are in use.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(DispatchError::BufferTooSmall {
                required: len,
                available: self.capacity(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Copy `payload` into the data region and declare its length.
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.set_len(payload.len())?;
        self.data_mut()[..payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// The whole buffer, header reserve included.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage
    }

    /// The whole buffer, header reserve included.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// True when `other` has the same header reserve and data capacity.
    pub fn same_geometry(&self, other: &PacketBuffer) -> bool {
        self.header_reserve == other.header_reserve && self.storage.len() == other.storage.len()
    }

    /// Forget the packet held. Contents are not zeroed.
    pub fn clear(&mut self) {
        self.format = FORMAT_UNKNOWN;
        self.fill = 0;
        self.len = 0;
    }

    pub(crate) fn set_format(&mut self, format: u8) {
        self.format = format;
    }

    pub(crate) fn begin_fill(&mut self, format: u8, offset: usize) {
        self.format = format;
        self.fill = offset;
        self.len = 0;
    }

    /// Append one received byte. `false` when the buffer is full.
    pub(crate) fn push(&mut self, byte: u8) -> bool {
        match self.storage.get_mut(self.fill) {
            Some(slot) => {
                *slot = byte;
                self.fill += 1;
                true
            }
            None => false,
        }
    }

    pub(crate) fn finish_fill(&mut self) {
        self.len = self.fill.saturating_sub(self.header_reserve);
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("header_reserve", &self.header_reserve)
            .field("capacity", &self.capacity())
            .field("format", &self.format)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        let buf = PacketBuffer::new(DEFAULT_HEADER_RESERVE, DEFAULT_DATA_CAPACITY);
        assert_eq!(buf.header_reserve(), 8);
        assert_eq!(buf.capacity(), 120);
        assert_eq!(buf.total_len(), 128);
        assert_eq!(buf.format(), FORMAT_UNKNOWN);
        assert!(buf.is_empty());
    }

    #[test]
    fn payload_lands_after_reserve() {
        let mut buf = PacketBuffer::new(4, 8);
        buf.set_payload(&[1, 2, 3]).unwrap();
        assert_eq!(buf.payload(), &[1, 2, 3]);
        assert_eq!(&buf.as_slice()[4..7], &[1, 2, 3]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = PacketBuffer::new(0, 2);
        let err = buf.set_payload(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::BufferTooSmall {
                required: 3,
                available: 2
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn push_stops_at_end_of_storage() {
        let mut buf = PacketBuffer::new(1, 2);
        buf.begin_fill(7, 1);
        assert!(buf.push(10));
        assert!(buf.push(11));
        assert!(!buf.push(12));
        buf.finish_fill();
        assert_eq!(buf.format(), 7);
        assert_eq!(buf.payload(), &[10, 11]);
    }

    #[test]
    fn same_geometry_compares_layout_only() {
        let a = PacketBuffer::new(8, 120);
        let mut b = PacketBuffer::new(8, 120);
        b.set_payload(&[1]).unwrap();
        assert!(a.same_geometry(&b));
        assert!(!a.same_geometry(&PacketBuffer::new(4, 124)));
    }
}
