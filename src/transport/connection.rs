//! # Connection
//!
//! One accepted or dialed socket. A connection runs up to three tokio tasks:
//!
//! - **reader**: owns the [`ReceivePipeline`] and enqueues parsed packets to the core
//! - **writer**: writes finished send buffers to the socket in order
//! - **flusher**: sends the pending joined packet group on a timer (only when the
//!   connection state allows joining)
//!
//! Game logic never touches the socket. It calls [`Connection::send_packet_group`],
//! which queues the group for an outgoing worker and returns immediately.
//!
//! A connection is closed exactly once. The first closing reason wins, the tasks are
//! cancelled and the state's `on_close` is delivered later on the main-loop thread.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::group::{GroupKind, PacketGroup};
use crate::protocol::packet::{IncomingPacket, OutgoingPacket};
use crate::protocol::strategy::{Compression, ConnectionState};
use crate::transport::cipher::{Cipher, CipherMode};
use crate::transport::core::CoreShared;
use crate::transport::receive::{ReceiveContext, ReceivePipeline};
use crate::utils::buffer_pool::PooledBuffer;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Process-unique connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Encrypted payload on its way to the socket.
pub(crate) struct SendBuffer {
    buf: PooledBuffer,
    len: usize,
}

impl SendBuffer {
    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

pub struct Connection<S: ConnectionState> {
    id: ConnectionId,
    endpoint: SocketAddr,
    state: S,
    cipher: Cipher,
    compression: Option<Arc<dyn Compression>>,
    joining_allowed: bool,
    joined: Mutex<Option<Arc<PacketGroup>>>,
    close_reason: OnceLock<String>,
    shutdown: CancellationToken,
    writer: mpsc::UnboundedSender<SendBuffer>,
    core: Weak<CoreShared<S>>,
}

impl<S: ConnectionState> Connection<S> {
    pub(crate) fn new(
        id: ConnectionId,
        endpoint: SocketAddr,
        state: S,
        core: &Arc<CoreShared<S>>,
        writer: mpsc::UnboundedSender<SendBuffer>,
    ) -> Self {
        let cipher = Cipher::new(state.encryption());
        let compression = state.compression();
        let joining_allowed = state.packet_groups_joining_allowed();
        Self {
            id,
            endpoint,
            state,
            cipher,
            compression,
            joining_allowed,
            joined: Mutex::new(None),
            close_reason: OnceLock::new(),
            shutdown: core.shutdown_token().child_token(),
            writer,
            core: Arc::downgrade(core),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn cipher_mode(&self) -> CipherMode {
        self.cipher.mode()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.get().is_some()
    }

    /// Reason given by the first successful [`close`](Self::close).
    pub fn closing_reason(&self) -> Option<&str> {
        self.close_reason.get().map(String::as_str)
    }

    /// Close the connection. Returns `false` if it was already closed; the first
    /// reason is kept.
    pub fn close(&self, reason: &str) -> bool {
        if self.close_reason.set(reason.to_string()).is_err() {
            trace!(conn = %self.id, reason, "Connection already closed");
            return false;
        }

        debug!(conn = %self.id, endpoint = %self.endpoint, reason, "Closing connection");
        self.shutdown.cancel();
        self.lock_joined().take();
        if let Some(core) = self.core.upgrade() {
            core.connection_closed(self.id);
        }
        true
    }

    fn lock_joined(&self) -> std::sync::MutexGuard<'_, Option<Arc<PacketGroup>>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `group` for transmission. Never blocks and never touches the socket.
    pub fn send_packet_group(self: &Arc<Self>, group: Arc<PacketGroup>) {
        if group.is_empty() {
            warn!(conn = %self.id, "Ignoring empty packet group");
            return;
        }
        if self.is_closed() {
            debug!(conn = %self.id, "Connection closed, packet group not sent");
            return;
        }

        if self.joining_allowed {
            let mut pending = self.lock_joined();
            // only a group nobody else holds may have its packets moved out
            if group.kind() == GroupKind::SingleUse && Arc::strong_count(&group) == 1 {
                let max_packets = self.max_joined_packets();
                if let Some(current) = pending.as_ref() {
                    if current.try_join(&group, max_packets) {
                        return;
                    }
                }
                if let Some(previous) = pending.replace(group) {
                    self.dispatch(previous);
                }
                return;
            }
            if let Some(previous) = pending.take() {
                self.dispatch(previous);
            }
            self.dispatch(group);
            return;
        }

        self.dispatch(group);
    }

    /// Wrap one packet in a single-use group and send it.
    pub fn send_packet<P: OutgoingPacket>(self: &Arc<Self>, packet: P) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let group = PacketGroup::single_use(core.pool());
        group.add(packet);
        self.send_packet_group(group);
    }

    /// Send the pending joined group now.
    pub fn flush_joined(self: &Arc<Self>) {
        let pending = self.lock_joined().take();
        if let Some(group) = pending {
            self.dispatch(group);
        }
    }

    fn max_joined_packets(&self) -> usize {
        self.core
            .upgrade()
            .map(|core| core.config().max_joined_packets)
            .unwrap_or(0)
    }

    pub(crate) fn dispatch(self: &Arc<Self>, group: Arc<PacketGroup>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        group.enqueue();
        if !core.submit(self.clone(), group.clone()) {
            group.dequeue();
        }
    }

    /// Compress, encrypt and hand the group to the socket writer.
    ///
    /// Runs on an outgoing worker. The group is always dequeued; a failure closes the
    /// connection. A panic in the packet, compression or encryption code closes only
    /// this connection and leaves the worker running.
    pub fn process_sending(&self, group: &PacketGroup) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.encode_and_queue(group)));
        group.dequeue();
        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                warn!(conn = %self.id, error = %e, "Sending packet group failed");
                e.to_string()
            }
            Err(_) => {
                error!(conn = %self.id, "Sending packet group panicked");
                constants::ERR_SEND_PANICKED.to_string()
            }
        };
        if let Some(core) = self.core.upgrade() {
            core.metrics().connection_error();
        }
        self.close(&reason);
    }

    fn encode_and_queue(&self, group: &PacketGroup) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if group.is_disposed() {
            warn!(conn = %self.id, "Packet group disposed before it was sent");
            return Ok(());
        }
        let core = self.core.upgrade().ok_or(ProtocolError::ConnectionClosed)?;

        let mut buf = core.pool().acquire();
        let len = group.with_final_bytes(self.compression.as_deref(), |bytes| {
            self.cipher.encrypt(bytes, &mut buf)
        })??;

        self.writer
            .send(SendBuffer { buf, len })
            .map_err(|_| ProtocolError::Io(std::io::Error::other(constants::REASON_WRITER_GONE)))?;
        core.metrics().group_sent();
        Ok(())
    }

    /// Spawn the reader, writer and (when joining is allowed) flusher tasks.
    pub(crate) fn start<T>(
        self: &Arc<Self>,
        core: &Arc<CoreShared<S>>,
        stream: T,
        rx: mpsc::UnboundedReceiver<SendBuffer>,
    ) where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let runtime = core.runtime();
        runtime.spawn(read_loop(self.clone(), core.clone(), reader));
        runtime.spawn(write_loop(self.clone(), core.clone(), writer, rx));
        if self.joining_allowed {
            runtime.spawn(flush_loop(self.clone(), core.config().joined_group_interval));
        }
    }
}

impl<S: ConnectionState> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("cipher", &self.cipher.mode())
            .field("closed", &self.closing_reason())
            .finish()
    }
}

async fn read_loop<S, R>(conn: Arc<Connection<S>>, core: Arc<CoreShared<S>>, mut reader: R)
where
    S: ConnectionState,
    R: AsyncRead + Unpin,
{
    let mut pipeline = ReceivePipeline::new(core.pool());
    let mut sink = |packet: Box<dyn IncomingPacket<S>>| core.enqueue_incoming(&conn, packet);

    loop {
        let Some(buf) = pipeline.read_buf() else {
            conn.close(constants::ERR_INCOMING_BUFFER_FULL);
            break;
        };
        let read = tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            read = reader.read(buf) => read,
        };

        match read {
            Ok(0) => {
                conn.close(constants::REASON_REMOTE_CLOSED);
                break;
            }
            Ok(received) => {
                core.metrics().bytes_in(received as u64);
                let ctx = ReceiveContext {
                    id: conn.id,
                    protocol: core.protocol(),
                    cipher: &conn.cipher,
                    compression: conn.compression.as_deref(),
                    metrics: core.metrics(),
                };
                if let Err(e) = pipeline.on_received(received, &ctx, &mut sink) {
                    debug!(conn = %conn.id, error = %e, "Receive pipeline failed");
                    core.metrics().connection_error();
                    conn.close(&e.to_string());
                    break;
                }
            }
            Err(e) => {
                debug!(conn = %conn.id, error = %e, "Socket read failed");
                core.metrics().connection_error();
                conn.close(&e.to_string());
                break;
            }
        }
    }
    trace!(conn = %conn.id, "Reader task finished");
}

async fn write_loop<S, W>(
    conn: Arc<Connection<S>>,
    core: Arc<CoreShared<S>>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<SendBuffer>,
) where
    S: ConnectionState,
    W: AsyncWrite + Unpin,
{
    loop {
        let send = tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            send = rx.recv() => match send {
                Some(send) => send,
                None => break,
            },
        };

        let written = async {
            writer.write_all(send.bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!(conn = %conn.id, error = %e, "Socket write failed");
            core.metrics().connection_error();
            conn.close(&e.to_string());
            break;
        }
        core.metrics().bytes_out(send.len as u64);
    }

    let _ = writer.shutdown().await;
    trace!(conn = %conn.id, "Writer task finished");
}

async fn flush_loop<S: ConnectionState>(conn: Arc<Connection<S>>, period: std::time::Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = conn.shutdown.cancelled() => break,
            _ = interval.tick() => conn.flush_joined(),
        }
    }
}
