//! Pluggable 16-bit frame checksums.
//!
//! The engine only needs a running update over SEQ..payload; which polynomial
//! is used is a property of the link. [`Crc16Xmodem`] is the default.

/// A 16-bit running checksum.
pub trait Checksum {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Initial register value.
    fn init(&self) -> u16;

    /// Fold one byte into the running value.
    fn update(&self, crc: u16, byte: u8) -> u16;

    /// Checksum of a complete byte slice.
    fn compute(&self, data: &[u8]) -> u16 {
        data.iter()
            .fold(self.init(), |crc, &byte| self.update(crc, byte))
    }
}

impl<C: Checksum + ?Sized> Checksum for Box<C> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn init(&self) -> u16 {
        (**self).init()
    }

    fn update(&self, crc: u16, byte: u8) -> u16 {
        (**self).update(crc, byte)
    }
}

/// CRC-16/XMODEM
/// Polynomial: 0x1021, Init: 0x0000, RefIn: false, RefOut: false, XorOut: 0x0000
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16Xmodem;

impl Checksum for Crc16Xmodem {
    fn name(&self) -> &'static str {
        "CRC-16/XMODEM"
    }

    fn init(&self) -> u16 {
        0x0000
    }

    fn update(&self, crc: u16, byte: u8) -> u16 {
        let mut crc = crc ^ ((byte as u16) << 8);
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
        crc
    }
}

/// CRC-16/Modbus
/// Polynomial: 0x8005, Init: 0xFFFF, RefIn: true, RefOut: true, XorOut: 0x0000
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16Modbus;

impl Checksum for Crc16Modbus {
    fn name(&self) -> &'static str {
        "CRC-16/MODBUS"
    }

    fn init(&self) -> u16 {
        0xFFFF
    }

    fn update(&self, crc: u16, byte: u8) -> u16 {
        let mut crc = crc ^ byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
        crc
    }
}
