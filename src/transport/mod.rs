//! # Transport Layer
//!
//! Sockets, connections and the engine core.
//!
//! ## Components
//! - **AsyncCore**: connection registry, incoming queue, outgoing workers, main-loop tick
//! - **Connection**: per-socket reader, writer and joined-group flusher tasks
//! - **Receive pipeline**: handshake, decryption, decompression and framing of incoming bytes
//! - **Cipher**: encryption state shared by both directions of a connection
//! - **TCP**: listener and connector

pub mod cipher;
pub mod connection;
pub mod core;
pub(crate) mod receive;
pub(crate) mod tcp;

pub use cipher::CipherMode;
pub use connection::{Connection, ConnectionId};
pub use self::core::AsyncCore;
