//! # Protocol Layer
//!
//! Packet contracts, the id table and the outgoing unit of transmission.
//!
//! ## Components
//! - **Packets**: [`IncomingPacket`] parsed on I/O tasks and handled on the main loop,
//!   [`OutgoingPacket`] serialized by outgoing workers
//! - **Protocol**: 256-slot table from leading id byte to packet factory
//! - **PacketGroup**: batch of outgoing packets, compressed once and shared by any
//!   number of connections
//! - **Strategies**: pluggable encryption, compression and per-connection state
//!
//! ## Parse Outcomes
//! A packet's `read` reports one of [`ReadPacketResult`]. Running off the end of the
//! buffered bytes is never an error for the connection; the packet is retried once more
//! data arrived.

pub mod group;
pub mod packet;
pub mod strategy;
pub mod table;

pub use group::{GroupKind, GroupStage, PacketGroup};
pub use packet::{write_packet, IncomingPacket, OutgoingPacket, ReadPacketResult};
pub use strategy::{
    Compression, ConnectionState, Decompressed, Encryption, EncryptionInit, StateFactory,
};
pub use table::{PacketEntry, Protocol};
