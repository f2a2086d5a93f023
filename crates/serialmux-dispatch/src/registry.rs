use std::collections::BTreeMap;

use crate::dispatcher::PacketHandler;
use crate::error::{DispatchError, Result};
use crate::format::{FormatDescriptor, FORMAT_UNKNOWN};

pub(crate) struct Registration {
    pub(crate) descriptor: Box<dyn FormatDescriptor>,
    pub(crate) handler: Box<dyn PacketHandler>,
}

/// Format ids mapped to their descriptor and consumer.
#[derive(Default)]
pub struct FormatRegistry {
    entries: BTreeMap<u8, Registration>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a format. Fails for [`FORMAT_UNKNOWN`] and for ids already
    /// in use.
    pub fn register(
        &mut self,
        format: u8,
        descriptor: Box<dyn FormatDescriptor>,
        handler: Box<dyn PacketHandler>,
    ) -> Result<()> {
        if format == FORMAT_UNKNOWN {
            return Err(DispatchError::FormatReserved(format));
        }
        if self.entries.contains_key(&format) {
            return Err(DispatchError::FormatInUse(format));
        }
        self.entries.insert(
            format,
            Registration {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a format, returning its consumer.
    pub fn unregister(&mut self, format: u8) -> Option<Box<dyn PacketHandler>> {
        self.entries.remove(&format).map(|entry| entry.handler)
    }

    pub fn contains(&self, format: u8) -> bool {
        self.entries.contains_key(&format)
    }

    pub fn descriptor(&self, format: u8) -> Option<&dyn FormatDescriptor> {
        self.entries.get(&format).map(|entry| entry.descriptor.as_ref())
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get_mut(&mut self, format: u8) -> Option<&mut Registration> {
        self.entries.get_mut(&format)
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(id, entry)| (id, entry.descriptor.name())),
            )
            .finish()
    }
}
