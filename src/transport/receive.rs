//! Incoming byte pipeline of one connection.
//!
//! ```text
//! socket -> raw -> [handshake] -> decrypt -> clear -> decompress -> window -> framing
//! ```
//!
//! Each stage keeps the bytes the next stage could not take yet, so any split of the
//! incoming stream into reads yields the same packets. The pipeline is owned by the
//! connection's reader task and its pooled buffers go back when the task ends.

use crate::error::{ProtocolError, Result};
use crate::protocol::packet::{read_packet, IncomingPacket, ReadPacketResult};
use crate::protocol::strategy::{Compression, ConnectionState};
use crate::protocol::table::Protocol;
use crate::transport::cipher::{Cipher, CipherMode};
use crate::transport::connection::ConnectionId;
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};
use crate::utils::hexdump::hexdump;
use crate::utils::metrics::Metrics;
use tracing::{debug, trace};

/// Everything the pipeline borrows from its connection for one pass.
pub(crate) struct ReceiveContext<'a, S: ConnectionState> {
    pub id: ConnectionId,
    pub protocol: &'a Protocol<S>,
    pub cipher: &'a Cipher,
    pub compression: Option<&'a dyn Compression>,
    pub metrics: &'a Metrics,
}

pub(crate) struct ReceivePipeline {
    raw: PooledBuffer,
    raw_len: usize,
    clear: PooledBuffer,
    clear_len: usize,
    window: PooledBuffer,
    window_offset: usize,
    window_len: usize,
}

impl ReceivePipeline {
    pub(crate) fn new(pool: &BufferPool) -> Self {
        Self {
            raw: pool.acquire(),
            raw_len: 0,
            clear: pool.acquire(),
            clear_len: 0,
            window: pool.acquire(),
            window_offset: 0,
            window_len: 0,
        }
    }

    /// Free space to read the next socket bytes into, or `None` when the raw buffer
    /// is full.
    pub(crate) fn read_buf(&mut self) -> Option<&mut [u8]> {
        if self.raw_len == self.raw.len() {
            return None;
        }
        Some(&mut self.raw[self.raw_len..])
    }

    /// Bytes waiting in the raw, cleartext and framing stages.
    pub(crate) fn buffered(&self) -> (usize, usize, usize) {
        (self.raw_len, self.clear_len, self.window_len)
    }

    /// Run the pipeline after `received` bytes were read into [`Self::read_buf`].
    ///
    /// Every complete packet is handed to `sink` in stream order. An error is fatal
    /// for the connection.
    pub(crate) fn on_received<S, F>(
        &mut self,
        received: usize,
        ctx: &ReceiveContext<'_, S>,
        sink: &mut F,
    ) -> Result<()>
    where
        S: ConnectionState,
        F: FnMut(Box<dyn IncomingPacket<S>>),
    {
        self.raw_len = (self.raw_len + received).min(self.raw.len());

        if ctx.cipher.mode() == CipherMode::Pending {
            match ctx.cipher.handshake(&self.raw[..self.raw_len])? {
                Some(consumed) => {
                    debug!(conn = %ctx.id, mode = ?ctx.cipher.mode(), "Encryption handshake complete");
                    self.consume_raw(consumed);
                }
                None => return Ok(()),
            }
        }

        loop {
            let mut progress = self.decrypt(ctx)?;
            progress |= self.decompress(ctx)?;
            progress |= self.frame(ctx, sink);
            self.recycle()?;
            if !progress {
                return Ok(());
            }
        }
    }

    fn decrypt<S: ConnectionState>(&mut self, ctx: &ReceiveContext<'_, S>) -> Result<bool> {
        let take = self.raw_len.min(self.clear.len() - self.clear_len);
        if take == 0 {
            return Ok(false);
        }
        let produced = ctx
            .cipher
            .decrypt(&self.raw[..take], &mut self.clear[self.clear_len..])?;
        self.clear_len += produced;
        self.consume_raw(take);
        Ok(true)
    }

    fn decompress<S: ConnectionState>(&mut self, ctx: &ReceiveContext<'_, S>) -> Result<bool> {
        if self.clear_len == 0 {
            return Ok(false);
        }
        let mut progress = self.decompress_into_tail(ctx)?;
        if !progress && self.window_offset > 0 {
            // a whole block may only fit once the consumed prefix is reclaimed
            self.compact();
            progress = self.decompress_into_tail(ctx)?;
        }
        Ok(progress)
    }

    fn decompress_into_tail<S: ConnectionState>(&mut self, ctx: &ReceiveContext<'_, S>) -> Result<bool> {
        let start = self.window_offset + self.window_len;
        let out = &mut self.window[start..];
        let (consumed, produced) = match ctx.compression {
            Some(compression) => {
                let d = compression.decompress(&self.clear[..self.clear_len], out)?;
                (d.consumed.min(self.clear_len), d.produced.min(out.len()))
            }
            None => {
                let n = self.clear_len.min(out.len());
                out[..n].copy_from_slice(&self.clear[..n]);
                (n, n)
            }
        };
        self.window_len += produced;
        self.consume_clear(consumed);
        Ok(consumed > 0 || produced > 0)
    }

    fn frame<S, F>(&mut self, ctx: &ReceiveContext<'_, S>, sink: &mut F) -> bool
    where
        S: ConnectionState,
        F: FnMut(Box<dyn IncomingPacket<S>>),
    {
        let mut progress = false;
        while self.window_len > 0 {
            let window = &self.window[self.window_offset..self.window_offset + self.window_len];
            let id = window[0];

            let Some(entry) = ctx.protocol.get(id) else {
                ctx.metrics.packet_unknown();
                debug!(
                    conn = %ctx.id,
                    packet_id = format_args!("0x{id:02x}"),
                    error = %ProtocolError::UnknownPacket(id),
                    bytes = window.len(),
                    dump = %hexdump(window),
                    "Unknown packet id, discarding buffered data"
                );
                self.discard_window();
                return true;
            };

            let mut packet = entry.create();
            let (result, consumed) = read_packet(packet.as_mut(), &window[1..]);
            match result {
                ReadPacketResult::NeedMoreData => {
                    trace!(conn = %ctx.id, packet = entry.name(), buffered = window.len(), "Waiting for more data");
                    break;
                }
                ReadPacketResult::Success => {
                    ctx.metrics.packet_received();
                    if entry.discard_after_reading() {
                        ctx.metrics.packet_discarded();
                        trace!(conn = %ctx.id, packet = entry.name(), "Packet read and ignored");
                    } else {
                        sink(packet);
                    }
                    self.advance(1 + consumed);
                }
                ReadPacketResult::DiscardSingle => {
                    ctx.metrics.packet_discarded();
                    debug!(
                        conn = %ctx.id,
                        packet = entry.name(),
                        dump = %hexdump(&window[..1 + consumed]),
                        "Discarding malformed packet"
                    );
                    self.advance(1 + consumed);
                }
                ReadPacketResult::DiscardAll => {
                    ctx.metrics.packet_discarded();
                    debug!(
                        conn = %ctx.id,
                        packet = entry.name(),
                        bytes = window.len(),
                        dump = %hexdump(window),
                        "Discarding all buffered data"
                    );
                    self.discard_window();
                    return true;
                }
            }
            progress = true;
        }
        progress
    }

    /// Make room at the end of the framing window.
    fn recycle(&mut self) -> Result<()> {
        let capacity = self.window.len();
        if self.window_len == 0 {
            self.window_offset = 0;
            return Ok(());
        }
        let at_end = self.window_offset + self.window_len == capacity;
        if self.window_offset > capacity / 2 || at_end {
            self.compact();
        }
        if self.window_len == capacity {
            return Err(ProtocolError::IncomingBufferFull);
        }
        Ok(())
    }

    /// Move the unframed bytes to the start of the window.
    fn compact(&mut self) {
        if self.window_offset == 0 {
            return;
        }
        let range = self.window_offset..self.window_offset + self.window_len;
        self.window.copy_within(range, 0);
        self.window_offset = 0;
    }

    fn advance(&mut self, count: usize) {
        let count = count.min(self.window_len);
        self.window_offset += count;
        self.window_len -= count;
    }

    fn discard_window(&mut self) {
        self.window_offset = 0;
        self.window_len = 0;
    }

    fn consume_raw(&mut self, count: usize) {
        let count = count.min(self.raw_len);
        self.raw.copy_within(count..self.raw_len, 0);
        self.raw_len -= count;
    }

    fn consume_clear(&mut self, count: usize) {
        let count = count.min(self.clear_len);
        self.clear.copy_within(count..self.clear_len, 0);
        self.clear_len -= count;
    }
}
