//! Persistence of packets whose delivery is not yet complete.
//!
//! A packet lives in the session exactly as long as the protocol considers
//! it undelivered or unacknowledged. Outgoing QoS 1/2 publishes stay until
//! their final ack, the stored PUBLISH is swapped for a PUBREL once the
//! receiver confirms, and incoming QoS 2 publishes stay until released.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

use crate::packet::{self, Packet};

/// Direction a stored packet travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Session store contract. Implementations persist packets in their
/// encoded byte form keyed by `(direction, packet id)`, which keeps the
/// interface identical for in-memory and on-disk stores.
///
/// Implementations must be safe to share between the reader task and
/// callers
pub trait Session: Send + Sync {
    /// Stores a packet under its packet id, replacing any previous packet
    /// with the same key
    fn save(&self, direction: Direction, packet: &Packet) -> Result<(), packet::Error>;

    /// Returns the stored packet for an id
    fn lookup(&self, direction: Direction, id: u16) -> Result<Option<Packet>, packet::Error>;

    /// Removes the stored packet for an id
    fn delete(&self, direction: Direction, id: u16);

    /// Returns all stored packets of a direction, ordered by packet id
    fn all(&self, direction: Direction) -> Result<Vec<Packet>, packet::Error>;

    /// Drops every stored packet
    fn reset(&self);
}

/// Default in-memory session store
pub struct MemorySession {
    incoming: Mutex<BTreeMap<u16, Bytes>>,
    outgoing: Mutex<BTreeMap<u16, Bytes>>,
}

impl MemorySession {
    pub fn new() -> MemorySession {
        MemorySession {
            incoming: Mutex::new(BTreeMap::new()),
            outgoing: Mutex::new(BTreeMap::new()),
        }
    }

    fn packets(&self, direction: Direction) -> &Mutex<BTreeMap<u16, Bytes>> {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl Session for MemorySession {
    fn save(&self, direction: Direction, packet: &Packet) -> Result<(), packet::Error> {
        let mut buffer = BytesMut::new();
        packet.write(&mut buffer, usize::MAX)?;

        let mut packets = self.packets(direction).lock().unwrap();
        packets.insert(packet.packet_id(), buffer.freeze());
        Ok(())
    }

    fn lookup(&self, direction: Direction, id: u16) -> Result<Option<Packet>, packet::Error> {
        let encoded = match self.packets(direction).lock().unwrap().get(&id) {
            Some(encoded) => encoded.clone(),
            None => return Ok(None),
        };

        let mut buffer = BytesMut::from(&encoded[..]);
        Ok(Some(Packet::read(&mut buffer, usize::MAX)?))
    }

    fn delete(&self, direction: Direction, id: u16) {
        self.packets(direction).lock().unwrap().remove(&id);
    }

    fn all(&self, direction: Direction) -> Result<Vec<Packet>, packet::Error> {
        let encoded: Vec<Bytes> = self
            .packets(direction)
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();

        let mut packets = Vec::with_capacity(encoded.len());
        for bytes in encoded {
            let mut buffer = BytesMut::from(&bytes[..]);
            packets.push(Packet::read(&mut buffer, usize::MAX)?);
        }

        Ok(packets)
    }

    fn reset(&self) {
        self.incoming.lock().unwrap().clear();
        self.outgoing.lock().unwrap().clear();
    }
}
