//! Id table mapping the leading byte of an incoming packet to its reader.

use crate::protocol::packet::IncomingPacket;
use crate::protocol::strategy::ConnectionState;
use std::fmt;

type PacketFactory<S> = dyn Fn() -> Box<dyn IncomingPacket<S>> + Send + Sync + 'static;

/// One registered packet id.
pub struct PacketEntry<S: ConnectionState> {
    name: &'static str,
    factory: Box<PacketFactory<S>>,
    discard_after_reading: bool,
}

impl<S: ConnectionState> PacketEntry<S> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Parsed to find its length, then dropped without being handled.
    pub fn discard_after_reading(&self) -> bool {
        self.discard_after_reading
    }

    pub fn create(&self) -> Box<dyn IncomingPacket<S>> {
        (self.factory)()
    }
}

/// Maps the leading id byte of a packet to its reader.
///
/// Built once at startup and shared read-only by every connection of a core.
pub struct Protocol<S: ConnectionState> {
    entries: Vec<Option<PacketEntry<S>>>,
}

impl<S: ConnectionState> Default for Protocol<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConnectionState> Protocol<S> {
    pub fn new() -> Self {
        Self {
            entries: (0..=u8::MAX).map(|_| None).collect(),
        }
    }

    /// Register the reader for `id`, replacing any previous registration.
    pub fn register<F>(mut self, id: u8, name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn IncomingPacket<S>> + Send + Sync + 'static,
    {
        self.insert(id, name, Box::new(factory), false);
        self
    }

    /// Register a packet that is read (to skip its bytes) but never handled.
    pub fn register_ignored<F>(mut self, id: u8, name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn IncomingPacket<S>> + Send + Sync + 'static,
    {
        self.insert(id, name, Box::new(factory), true);
        self
    }

    fn insert(
        &mut self,
        id: u8,
        name: &'static str,
        factory: Box<PacketFactory<S>>,
        discard_after_reading: bool,
    ) {
        self.entries[id as usize] = Some(PacketEntry {
            name,
            factory,
            discard_after_reading,
        });
    }

    #[inline]
    pub fn get(&self, id: u8) -> Option<&PacketEntry<S>> {
        self.entries[id as usize].as_ref()
    }

    pub fn is_registered(&self, id: u8) -> bool {
        self.get(id).is_some()
    }

    /// Number of registered ids
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: ConnectionState> fmt::Debug for Protocol<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (id, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                map.entry(&format_args!("0x{id:02x}"), &entry.name);
            }
        }
        map.finish()
    }
}
