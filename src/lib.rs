//! # Packet Engine
//!
//! Transport and protocol engine for multiplayer game servers.
//!
//! Many concurrent sockets are turned into typed application packets and back over a
//! compact binary framing (`[id: u8][payload]`, repeated), with optional per-connection
//! encryption and compression underneath.
//!
//! ## Architecture
//! - **I/O tasks** (tokio) parse incoming bytes and queue packets; they never run game
//!   logic
//! - **Outgoing workers** (OS threads) compress and encrypt packet groups and hand the
//!   bytes to the socket writers
//! - **Main loop**: the application calls [`AsyncCore::cycle`] once per tick; every packet
//!   handler and every close notification runs there
//!
//! ## Modules
//! - [`core`]: read and write cursors used by packet implementations
//! - [`protocol`]: packet traits, id table, packet groups, strategy traits
//! - [`transport`]: connections, the async core, TCP plumbing
//! - [`utils`]: buffer pool, compression, metrics, logging, text helpers
//! - [`config`]: TOML / environment configuration with validation
//! - [`error`]: error taxonomy

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::{PacketReader, PacketWriter};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::{
    ConnectionState, IncomingPacket, OutgoingPacket, PacketGroup, Protocol, ReadPacketResult,
};
pub use crate::transport::{AsyncCore, Connection, ConnectionId};
