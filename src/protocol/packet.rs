//! Incoming and outgoing packet contracts.

use crate::core::{PacketReader, PacketWriter};
use crate::error::Result;
use crate::protocol::strategy::ConnectionState;
use crate::transport::connection::Connection;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of parsing one incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPacketResult {
    /// Fully parsed; dispatch it.
    Success,
    /// Malformed; skip the bytes this packet consumed.
    DiscardSingle,
    /// Unrecoverable; drop everything buffered after this point.
    DiscardAll,
    /// Not all bytes are here yet; consume nothing and retry later.
    NeedMoreData,
}

/// A packet decoded on an I/O task and handled on the main-loop thread.
pub trait IncomingPacket<S: ConnectionState>: Send + 'static {
    /// Parse the packet body. The id byte has already been consumed.
    ///
    /// Returning a truncation error from a reader primitive (via `?`) is the same as
    /// returning [`ReadPacketResult::NeedMoreData`].
    fn read(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult>;

    /// Apply the packet. Runs only on the main-loop thread.
    fn handle(self: Box<Self>, conn: &Arc<Connection<S>>, state: &S) -> Result<()>;
}

/// A packet serialized into a [`PacketGroup`](crate::protocol::group::PacketGroup).
pub trait OutgoingPacket: Send + 'static {
    fn id(&self) -> u8;

    /// Write the body. The id byte has already been written.
    fn write(&self, writer: &mut PacketWriter<'_>) -> Result<()>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn full_name(&self) -> String {
        format!("{} ( 0x{:02x} )", self.name(), self.id())
    }
}

/// Write id and body of `packet` at `offset`; returns the bytes written.
pub fn write_packet(packet: &dyn OutgoingPacket, buf: &mut [u8], offset: usize) -> Result<usize> {
    let mut writer = PacketWriter::new(buf, offset)?;
    writer.write_u8(packet.id())?;
    packet.write(&mut writer)?;
    Ok(writer.written())
}

/// Run `packet.read` over `bytes` and work out how many bytes it consumed.
///
/// Never fails: errors and panics inside the packet turn into `DiscardAll`, reads past
/// the buffered data into `NeedMoreData` with nothing consumed.
pub(crate) fn read_packet<S: ConnectionState>(
    packet: &mut dyn IncomingPacket<S>,
    bytes: &[u8],
) -> (ReadPacketResult, usize) {
    let mut reader = PacketReader::new(bytes);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| packet.read(&mut reader)));

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_truncation() => return (ReadPacketResult::NeedMoreData, 0),
        Ok(Err(e)) => {
            debug!(error = %e, "Packet read failed");
            return (ReadPacketResult::DiscardAll, 0);
        }
        Err(_) => {
            warn!("Packet read panicked");
            return (ReadPacketResult::DiscardAll, 0);
        }
    };

    let consumed = reader.consumed();
    if result == ReadPacketResult::NeedMoreData || consumed > bytes.len() {
        return (ReadPacketResult::NeedMoreData, 0);
    }
    (result, consumed)
}
