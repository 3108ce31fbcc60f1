//! # Error Types
//!
//! Error handling for the packet engine.
//!
//! Errors fall into three categories, and the engine treats each one differently:
//!
//! ## Error Categories
//! - **Per-packet errors**: truncated or malformed packet bodies. The framing loop maps
//!   them to `NeedMoreData` / `DiscardAll` and the connection stays open.
//! - **Connection-fatal errors**: socket failures, rejected encryption handshakes, a full
//!   incoming buffer, sending before encryption was initialised. The affected connection
//!   is closed with the error text as its closing reason.
//! - **Process-fatal errors**: [`ProtocolError::Fatal`]. Never swallowed by the tick loop;
//!   [`AsyncCore::cycle`](crate::transport::core::AsyncCore::cycle) aborts the batch and
//!   returns it to the caller.
//!
//! ## Example Usage
//! ```rust
//! use packet_engine::error::{ProtocolError, Result};
//!
//! fn checked_len(len: usize, available: usize) -> Result<usize> {
//!     if len > available {
//!         return Err(ProtocolError::Truncated { needed: len, available });
//!     }
//!     Ok(len)
//! }
//!
//! assert!(checked_len(4, 2).is_err());
//! ```

use std::io;
use std::sync::PoisonError;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Closing reasons
    pub const REASON_DISPOSED: &str = "Connection disposed";
    pub const REASON_REMOTE_CLOSED: &str = "Remote end closed the connection";
    pub const REASON_SHUTDOWN: &str = "Engine shutting down";
    pub const REASON_WRITER_GONE: &str = "Socket writer no longer available";

    /// Pipeline errors
    pub const ERR_ENCRYPTION_NOT_RECOGNISED: &str = "Encryption not recognised";
    pub const ERR_ENCRYPTION_NOT_INITIALISED: &str =
        "Tried sending data with encryption not initialised";
    pub const ERR_INCOMING_BUFFER_FULL: &str = "Incoming data buffer full";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_SEND_PANICKED: &str = "Sending packet group panicked";
    pub const ERR_HANDLER_PANICKED: &str = "Packet handler panicked";
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Buffer overflow: needed {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unknown packet 0x{0:02x}")]
    UnknownPacket(u8),

    #[error("{}", constants::ERR_ENCRYPTION_NOT_RECOGNISED)]
    EncryptionInitFailed,

    #[error("{}", constants::ERR_ENCRYPTION_NOT_INITIALISED)]
    EncryptionNotInitialized,

    #[error("{}", constants::ERR_INCOMING_BUFFER_FULL)]
    IncomingBufferFull,

    /// Returned by [`Encryption`](crate::protocol::Encryption) implementations that
    /// cannot encrypt an outgoing block.
    #[error("Encryption failed")]
    EncryptionFailure,

    /// Returned by [`Encryption`](crate::protocol::Encryption) implementations on
    /// corrupt incoming data. Closes the connection.
    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Recoverable failure of a packet handler or close callback. The tick loop logs
    /// it and carries on; handler code returns it for errors that should not stop
    /// the server.
    #[error("Packet handler error: {0}")]
    Handler(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl ProtocolError {
    /// Errors that must never be swallowed by the tick loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Fatal(_))
    }

    /// A read ran off the end of the available bytes; the framing loop waits for more data.
    pub fn is_truncation(&self) -> bool {
        matches!(self, ProtocolError::Truncated { .. })
    }
}

impl<T> From<PoisonError<T>> for ProtocolError {
    fn from(_: PoisonError<T>) -> Self {
        ProtocolError::Fatal(constants::ERR_LOCK_POISONED.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
