//! Encryption state of one connection.
//!
//! The handshake and `decrypt` run on the connection's reader task, `encrypt` on the
//! outgoing worker serving the connection. Both directions share the strategy object
//! behind one lock.

use crate::error::{ProtocolError, Result};
use crate::protocol::strategy::{Encryption, EncryptionInit};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Where the connection stands in the encryption handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// An encryption strategy is configured but the peer has not sent its handshake yet.
    Pending,
    /// Handshake done; traffic runs through the strategy.
    Encrypted,
    /// No strategy, or the handshake chose plaintext.
    Plain,
}

impl CipherMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CipherMode::Pending,
            1 => CipherMode::Encrypted,
            _ => CipherMode::Plain,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CipherMode::Pending => 0,
            CipherMode::Encrypted => 1,
            CipherMode::Plain => 2,
        }
    }
}

pub(crate) struct Cipher {
    mode: AtomicU8,
    strategy: Option<Mutex<Box<dyn Encryption>>>,
}

impl Cipher {
    pub(crate) fn new(strategy: Option<Box<dyn Encryption>>) -> Self {
        let mode = if strategy.is_some() {
            CipherMode::Pending
        } else {
            CipherMode::Plain
        };
        Self {
            mode: AtomicU8::new(mode.as_u8()),
            strategy: strategy.map(Mutex::new),
        }
    }

    pub(crate) fn mode(&self) -> CipherMode {
        CipherMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Offer the buffered handshake bytes to the strategy.
    ///
    /// Returns how many bytes the handshake used up, or `None` while more are needed.
    pub(crate) fn handshake(&self, bytes: &[u8]) -> Result<Option<usize>> {
        let Some(strategy) = &self.strategy else {
            return Ok(Some(0));
        };
        let outcome = strategy.lock()?.init(bytes);
        let (mode, consumed) = match outcome {
            EncryptionInit::UseEncryption { consumed } => (CipherMode::Encrypted, consumed),
            EncryptionInit::NoEncryption { consumed } => (CipherMode::Plain, consumed),
            EncryptionInit::NotEnoughData => return Ok(None),
            EncryptionInit::InvalidData => return Err(ProtocolError::EncryptionInitFailed),
        };
        self.mode.store(mode.as_u8(), Ordering::Release);
        Ok(Some(consumed.min(bytes.len())))
    }

    /// Turn received bytes into cleartext. `output` must be at least as long as `input`.
    pub(crate) fn decrypt(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        match (self.mode(), &self.strategy) {
            (CipherMode::Encrypted, Some(strategy)) => {
                let produced = strategy.lock()?.decrypt(input, output)?;
                Ok(produced.min(output.len()))
            }
            (CipherMode::Pending, _) => Err(ProtocolError::DecryptionFailure),
            _ => copy_into(input, output),
        }
    }

    /// Turn an outgoing payload into wire bytes.
    pub(crate) fn encrypt(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        match (self.mode(), &self.strategy) {
            (CipherMode::Encrypted, Some(strategy)) => {
                let produced = strategy.lock()?.encrypt(input, output)?;
                Ok(produced.min(output.len()))
            }
            (CipherMode::Pending, _) => Err(ProtocolError::EncryptionNotInitialized),
            _ => copy_into(input, output),
        }
    }
}

fn copy_into(input: &[u8], output: &mut [u8]) -> Result<usize> {
    if input.len() > output.len() {
        return Err(ProtocolError::BufferOverflow {
            needed: input.len(),
            available: output.len(),
        });
    }
    output[..input.len()].copy_from_slice(input);
    Ok(input.len())
}
