//! Pluggable per-connection strategies.
//!
//! The engine never knows which cipher or compression a game client speaks. The
//! embedding application supplies them through a [`ConnectionState`], which is created
//! once per connection by a [`StateFactory`].

use crate::error::Result;
use crate::transport::connection::ConnectionId;
use std::net::SocketAddr;
use std::sync::Arc;

/// Outcome of the encryption handshake run on the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionInit {
    /// Handshake recognised; all further traffic is encrypted.
    UseEncryption { consumed: usize },
    /// Handshake recognised; the peer talks plaintext.
    NoEncryption { consumed: usize },
    /// Wait for more bytes. Nothing was consumed.
    NotEnoughData,
    /// Unrecognised handshake. Fatal for the connection.
    InvalidData,
}

/// Stream cipher owned by one connection.
///
/// `decrypt` runs on the connection's I/O task, `encrypt` on outgoing worker threads;
/// the connection serializes access. Neither may produce more bytes than it was given.
pub trait Encryption: Send {
    /// Inspect the handshake bytes at the start of the stream.
    fn init(&mut self, bytes: &[u8]) -> EncryptionInit;

    /// Decrypt `input` into `output`, returning the number of bytes written.
    fn decrypt(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize>;

    /// Encrypt `input` into `output`, returning the number of bytes written.
    fn encrypt(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

/// Result of one decompression call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decompressed {
    /// Input bytes used up. Anything past this is offered again on the next call.
    pub consumed: usize,
    /// Bytes written to the output.
    pub produced: usize,
}

/// Compression applied to whole packet groups on send and to the incoming stream.
pub trait Compression: Send + Sync {
    /// Compress `input` into `output`, returning the number of bytes written.
    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;

    /// Decompress as much of `input` as possible into `output`.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<Decompressed>;
}

/// Per-connection application state.
///
/// Packet handlers receive a shared reference to it on the main-loop thread.
pub trait ConnectionState: Send + Sync + 'static {
    /// Cipher for this connection, taken once when the connection starts.
    fn encryption(&self) -> Option<Box<dyn Encryption>> {
        None
    }

    /// Compression for this connection, taken once when the connection starts.
    fn compression(&self) -> Option<Arc<dyn Compression>> {
        None
    }

    /// Whether small packet groups may be merged and flushed on a timer.
    fn packet_groups_joining_allowed(&self) -> bool {
        false
    }

    /// Called right after the connection is registered.
    fn on_init(&self, _id: ConnectionId, _endpoint: SocketAddr) {}

    /// Called exactly once, on the main-loop thread, after the connection closed.
    fn on_close(&self, reason: &str);
}

/// Creates the state for each new connection.
pub type StateFactory<S> = Arc<dyn Fn(ConnectionId, SocketAddr) -> S + Send + Sync + 'static>;
