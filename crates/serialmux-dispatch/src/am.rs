use bytes::{Buf, BufMut};

use crate::buffer::PacketBuffer;
use crate::error::{DispatchError, Result};
use crate::format::{ActiveMessageFormat, FORMAT_ACTIVE_MESSAGE};

/// Broadcast destination address.
pub const AM_BROADCAST: u16 = 0xFFFF;

/// Header of an active message packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmHeader {
    pub dest: u16,
    /// Data length; filled in by [`ActiveMessageFormat::prepare`].
    pub length: u8,
    pub group: u8,
    pub am_type: u8,
}

impl AmHeader {
    pub fn new(dest: u16, group: u8, am_type: u8) -> Self {
        Self {
            dest,
            length: 0,
            group,
            am_type,
        }
    }

    /// Write the header into the bytes just before `buffer`'s data region.
    pub fn write_to(&self, buffer: &mut PacketBuffer) -> Result<()> {
        let reserve = buffer.header_reserve();
        let start = reserve
            .checked_sub(ActiveMessageFormat::HEADER_LEN)
            .ok_or(DispatchError::BufferTooSmall {
                required: ActiveMessageFormat::HEADER_LEN,
                available: reserve,
            })?;
        let mut dst = &mut buffer.as_mut_slice()[start..reserve];
        dst.put_u16(self.dest);
        dst.put_u8(self.length);
        dst.put_u8(self.group);
        dst.put_u8(self.am_type);
        Ok(())
    }

    /// Parse a header from the start of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ActiveMessageFormat::HEADER_LEN {
            return None;
        }
        let mut src = bytes;
        Some(Self {
            dest: src.get_u16(),
            length: src.get_u8(),
            group: src.get_u8(),
            am_type: src.get_u8(),
        })
    }
}

impl ActiveMessageFormat {
    /// Fill `buffer` with an active message and return the upper-layer
    /// length to pass to [`Dispatcher::send`](crate::Dispatcher::send).
    pub fn prepare(buffer: &mut PacketBuffer, header: AmHeader, payload: &[u8]) -> Result<usize> {
        let length = u8::try_from(payload.len()).map_err(|_| DispatchError::LengthOutOfRange {
            format: FORMAT_ACTIVE_MESSAGE,
            len: payload.len(),
        })?;
        buffer.set_payload(payload)?;
        AmHeader { length, ..header }.write_to(buffer)?;
        buffer.set_format(FORMAT_ACTIVE_MESSAGE);
        Ok(payload.len())
    }
}
