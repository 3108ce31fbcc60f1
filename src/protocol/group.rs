//! # Packet Groups
//!
//! A packet group is the unit of transmission: its packets are serialized back to back,
//! compressed once and then encrypted per connection.
//!
//! ## Lifetime policies
//! - **SingleUse**: released as soon as the last connection it was queued to has sent it.
//! - **MultiUse**: kept for repeated sends; the owner calls [`PacketGroup::dispose`].
//! - **Free**: on first serialization the compressed bytes are copied into a standalone
//!   [`Bytes`] value and every pooled resource is released. Good for payloads cached for
//!   a long time.
//!
//! ## Stages
//! ```text
//! New -> Written -> Compressed (-> Frozen, Free groups only)
//! ```
//! Stages only move forward. Packets can only be added while the group is `New` and not
//! queued anywhere.

use crate::error::{ProtocolError, Result};
use crate::protocol::packet::{write_packet, OutgoingPacket};
use crate::protocol::strategy::Compression;
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    SingleUse,
    MultiUse,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupStage {
    New,
    Written,
    Compressed,
    Frozen,
}

struct GroupData {
    stage: GroupStage,
    packets: Vec<Box<dyn OutgoingPacket>>,
    packet_count: usize,
    uncompressed: Option<PooledBuffer>,
    uncompressed_len: usize,
    compressed: Option<PooledBuffer>,
    compressed_len: usize,
    frozen: Option<Bytes>,
}

impl GroupData {
    fn final_bytes(&self) -> &[u8] {
        if let Some(frozen) = &self.frozen {
            return frozen;
        }
        match (&self.compressed, &self.uncompressed) {
            (Some(buf), _) => &buf[..self.compressed_len],
            (None, Some(buf)) => &buf[..self.compressed_len],
            (None, None) => &[],
        }
    }

    fn release(&mut self) {
        self.packets.clear();
        self.uncompressed = None;
        self.compressed = None;
    }
}

/// An ordered batch of outgoing packets sent as one payload.
pub struct PacketGroup {
    kind: GroupKind,
    pool: BufferPool,
    data: Mutex<GroupData>,
    in_flight: AtomicUsize,
    disposed: AtomicBool,
}

impl PacketGroup {
    pub fn new(kind: GroupKind, pool: &BufferPool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            pool: pool.clone(),
            data: Mutex::new(GroupData {
                stage: GroupStage::New,
                packets: Vec::new(),
                packet_count: 0,
                uncompressed: None,
                uncompressed_len: 0,
                compressed: None,
                compressed_len: 0,
                frozen: None,
            }),
            in_flight: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn single_use(pool: &BufferPool) -> Arc<Self> {
        Self::new(GroupKind::SingleUse, pool)
    }

    pub fn multi_use(pool: &BufferPool) -> Arc<Self> {
        Self::new(GroupKind::MultiUse, pool)
    }

    pub fn free(pool: &BufferPool) -> Arc<Self> {
        Self::new(GroupKind::Free, pool)
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, GroupData> {
        // a poisoned group is still safe to release
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn stage(&self) -> GroupStage {
        self.lock().stage
    }

    /// Number of packets added to the group (kept after freezing).
    pub fn len(&self) -> usize {
        self.lock().packet_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections this group is currently queued to.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Append a packet. Refused once transmission has started.
    pub fn add<P: OutgoingPacket>(&self, packet: P) -> bool {
        self.add_boxed(Box::new(packet))
    }

    pub fn add_boxed(&self, packet: Box<dyn OutgoingPacket>) -> bool {
        let mut data = self.lock();
        if data.stage != GroupStage::New || self.in_flight() > 0 || self.is_disposed() {
            warn!(
                packet = %packet.full_name(),
                stage = ?data.stage,
                "Cannot add packet to a group that is already being sent"
            );
            return false;
        }
        data.packets.push(packet);
        data.packet_count += 1;
        true
    }

    /// Move all packets of `other` into this group.
    ///
    /// Both groups must still be new and unqueued, and the merged group may hold at most
    /// `max_packets` packets. Returns whether the merge happened.
    pub fn try_join(&self, other: &PacketGroup, max_packets: usize) -> bool {
        if std::ptr::eq(self, other) {
            return false;
        }
        let mut mine = self.lock();
        let mut theirs = other.lock();
        let mergeable = mine.stage == GroupStage::New
            && theirs.stage == GroupStage::New
            && self.in_flight() == 0
            && other.in_flight() == 0
            && !self.is_disposed()
            && !other.is_disposed()
            && mine.packet_count + theirs.packet_count <= max_packets;
        if !mergeable {
            return false;
        }

        let moved = theirs.packet_count;
        mine.packets.append(&mut theirs.packets);
        mine.packet_count += moved;
        theirs.packet_count = 0;
        true
    }

    /// Run `f` over the bytes to transmit, producing them on first use.
    ///
    /// Packets are serialized exactly once and compressed exactly once, using the
    /// `compression` of the first caller. Without compression the serialized bytes are
    /// used as they are. A `Free` group is frozen into a standalone buffer here.
    pub fn with_final_bytes<R, F>(&self, compression: Option<&dyn Compression>, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let mut data = self.lock();
        if self.is_disposed() {
            return Err(ProtocolError::InvalidData(
                "packet group already disposed".to_string(),
            ));
        }

        if data.stage == GroupStage::New {
            self.write_packets(&mut data)?;
        }
        if data.stage == GroupStage::Written {
            Self::compress(&self.pool, &mut data, compression)?;
        }
        if self.kind == GroupKind::Free && data.stage == GroupStage::Compressed {
            let frozen = Bytes::copy_from_slice(data.final_bytes());
            data.release();
            data.frozen = Some(frozen);
            data.stage = GroupStage::Frozen;
        }

        Ok(f(data.final_bytes()))
    }

    fn write_packets(&self, data: &mut GroupData) -> Result<()> {
        let mut buf = self.pool.acquire();
        let mut offset = 0;
        for packet in &data.packets {
            let written = write_packet(packet.as_ref(), &mut buf, offset)?;
            trace!(packet = %packet.full_name(), bytes = written, "Packet written");
            offset += written;
        }
        data.uncompressed = Some(buf);
        data.uncompressed_len = offset;
        data.stage = GroupStage::Written;
        Ok(())
    }

    fn compress(
        pool: &BufferPool,
        data: &mut GroupData,
        compression: Option<&dyn Compression>,
    ) -> Result<()> {
        match (compression, &data.uncompressed) {
            (Some(compression), Some(uncompressed)) => {
                let mut out = pool.acquire();
                let len = compression.compress(&uncompressed[..data.uncompressed_len], &mut out)?;
                data.compressed = Some(out);
                data.compressed_len = len;
            }
            _ => {
                data.compressed_len = data.uncompressed_len;
            }
        }
        data.stage = GroupStage::Compressed;
        Ok(())
    }

    /// The standalone payload of a frozen `Free` group.
    pub fn frozen_bytes(&self) -> Option<Bytes> {
        self.lock().frozen.clone()
    }

    /// Mark the group as queued to one more connection.
    pub fn enqueue(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one queued send as finished. A `SingleUse` group is disposed when the last
    /// send finishes.
    pub fn dequeue(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) if self.kind == GroupKind::SingleUse => {
                self.dispose();
            }
            Ok(_) => {}
            Err(_) => warn!("Packet group dequeued more often than enqueued"),
        }
    }

    /// Release packets and pooled buffers. Returns `false` if already disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut data = self.lock();
        data.release();
        data.frozen = None;
        trace!(kind = ?self.kind, "Packet group disposed");
        true
    }
}

impl fmt::Debug for PacketGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.lock();
        f.debug_struct("PacketGroup")
            .field("kind", &self.kind)
            .field("stage", &data.stage)
            .field("packets", &data.packet_count)
            .field("in_flight", &self.in_flight())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
