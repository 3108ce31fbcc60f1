//! # Async Core
//!
//! Owns everything the connections of one server share and drives the three thread
//! roles of the engine.
//!
//! ## Thread Roles
//! - **I/O tasks** (tokio): read sockets, parse packets, push them to the incoming queue
//! - **Outgoing workers** (OS threads): compress, encrypt and hand groups to the writers
//! - **Main loop** (the caller of [`AsyncCore::cycle`]): runs packet handlers and close
//!   notifications, one batch per tick
//!
//! ## Outgoing Ordering
//! Every connection is served by one fixed worker, chosen by connection id, so the
//! groups sent to a connection reach its socket in the order they were sent.
//!
//! ## Usage
//! ```rust,no_run
//! use packet_engine::config::EngineConfig;
//! use packet_engine::protocol::{ConnectionState, Protocol};
//! use packet_engine::transport::AsyncCore;
//!
//! struct Player;
//!
//! impl ConnectionState for Player {
//!     fn on_close(&self, reason: &str) {
//!         println!("player left: {reason}");
//!     }
//! }
//!
//! # async fn run() -> packet_engine::error::Result<()> {
//! let config = EngineConfig::default();
//! let core = AsyncCore::new(&config, Protocol::new(), |_id, _endpoint| Player)?;
//! core.listen(&config.server.address).await?;
//! loop {
//!     core.cycle()?;
//!     tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//! }
//! # }
//! ```

use crate::config::{CoreConfig, EngineConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::group::PacketGroup;
use crate::protocol::packet::IncomingPacket;
use crate::protocol::strategy::{ConnectionState, StateFactory};
use crate::protocol::table::Protocol;
use crate::transport::connection::{Connection, ConnectionId};
use crate::transport::tcp;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Work for the main-loop thread.
pub(crate) enum Incoming<S: ConnectionState> {
    Packet(Arc<Connection<S>>, Box<dyn IncomingPacket<S>>),
    Closed(Arc<Connection<S>>),
}

/// Work for an outgoing worker.
pub(crate) enum OutgoingJob<S: ConnectionState> {
    Send(Arc<Connection<S>>, Arc<PacketGroup>),
    Stop,
}

/// State shared by the core, its connections and their tasks.
pub(crate) struct CoreShared<S: ConnectionState> {
    config: CoreConfig,
    max_connections: usize,
    protocol: Protocol<S>,
    pool: BufferPool,
    factory: StateFactory<S>,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection<S>>>>,
    incoming: Mutex<Vec<Incoming<S>>>,
    outgoing: Vec<Sender<OutgoingJob<S>>>,
    metrics: Metrics,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl<S: ConnectionState> CoreShared<S> {
    pub(crate) fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn protocol(&self) -> &Protocol<S> {
        &self.protocol
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection<S>>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_incoming(&self) -> MutexGuard<'_, Vec<Incoming<S>>> {
        self.incoming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection over `stream` and start its tasks.
    pub(crate) fn accept<T>(self: &Arc<Self>, stream: T, endpoint: SocketAddr) -> Result<Arc<Connection<S>>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let state = (self.factory)(id, endpoint);
        let conn = Arc::new(Connection::new(id, endpoint, state, self, tx));

        {
            let mut connections = self.lock_connections();
            if connections.len() >= self.max_connections {
                warn!(endpoint = %endpoint, limit = self.max_connections, "Connection limit reached");
                return Err(ProtocolError::ConnectionLimit(self.max_connections));
            }
            connections.insert(id, conn.clone());
        }

        self.metrics.connection_established();
        info!(conn = %id, endpoint = %endpoint, "Connection established");
        conn.state().on_init(id, endpoint);
        conn.start(self, stream, rx);
        Ok(conn)
    }

    /// Called once per connection by [`Connection::close`].
    pub(crate) fn connection_closed(&self, id: ConnectionId) {
        let removed = self.lock_connections().remove(&id);
        if let Some(conn) = removed {
            self.metrics.connection_closed();
            self.lock_incoming().push(Incoming::Closed(conn));
        }
    }

    pub(crate) fn enqueue_incoming(&self, conn: &Arc<Connection<S>>, packet: Box<dyn IncomingPacket<S>>) {
        self.lock_incoming().push(Incoming::Packet(conn.clone(), packet));
    }

    /// Hand a group to the worker serving `conn`. `false` once the workers stopped.
    pub(crate) fn submit(&self, conn: Arc<Connection<S>>, group: Arc<PacketGroup>) -> bool {
        let shard = (conn.id().get() % self.outgoing.len() as u64) as usize;
        self.outgoing[shard]
            .send(OutgoingJob::Send(conn, group))
            .is_ok()
    }
}

/// The transport engine of one server.
pub struct AsyncCore<S: ConnectionState> {
    shared: Arc<CoreShared<S>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: ConnectionState> AsyncCore<S> {
    /// Validate `config`, start the outgoing workers and return the core.
    ///
    /// Must be called from within a tokio runtime; connection tasks are spawned on it.
    pub fn new<F>(config: &EngineConfig, protocol: Protocol<S>, factory: F) -> Result<Self>
    where
        F: Fn(ConnectionId, SocketAddr) -> S + Send + Sync + 'static,
    {
        config.validate_strict()?;
        let runtime = Handle::try_current().map_err(|e| {
            ProtocolError::ConfigError(format!("AsyncCore must be created inside a tokio runtime: {e}"))
        })?;

        let core = &config.core;
        let pool = BufferPool::with_max_idle(
            core.buffer_size,
            core.preallocated_buffers,
            core.max_idle_buffers,
        );

        let mut outgoing = Vec::with_capacity(core.worker_threads);
        let mut workers = Vec::with_capacity(core.worker_threads);
        for index in 0..core.worker_threads {
            let (tx, rx) = channel::unbounded();
            let handle = thread::Builder::new()
                .name(format!("packet-worker-{index}"))
                .spawn(move || worker_loop(index, rx))?;
            outgoing.push(tx);
            workers.push(handle);
        }

        info!(
            workers = core.worker_threads,
            buffer_size = core.buffer_size,
            packets = protocol.len(),
            "Async core started"
        );

        Ok(Self {
            shared: Arc::new(CoreShared {
                config: core.clone(),
                max_connections: config.server.max_connections,
                protocol,
                pool,
                factory: Arc::new(factory),
                connections: Mutex::new(HashMap::new()),
                incoming: Mutex::new(Vec::new()),
                outgoing,
                metrics: Metrics::new(),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                runtime,
            }),
            workers: Mutex::new(workers),
        })
    }

    /// Start a connection over an already established stream.
    pub fn accept<T>(&self, stream: T, endpoint: SocketAddr) -> Result<Arc<Connection<S>>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.shared.accept(stream, endpoint)
    }

    /// Accept TCP connections on `addr` until shutdown. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        tcp::listen(&self.shared, addr).await
    }

    /// Dial `addr` and run the resulting socket as a connection of this core.
    pub async fn connect(&self, addr: &str) -> Result<Arc<Connection<S>>> {
        tcp::connect(&self.shared, addr).await
    }

    /// Queue a parsed packet for the next [`cycle`](Self::cycle). Callable from any thread.
    pub fn enqueue_incoming(&self, conn: &Arc<Connection<S>>, packet: Box<dyn IncomingPacket<S>>) {
        self.shared.enqueue_incoming(conn, packet);
    }

    /// Run every packet handler and close notification queued since the last call.
    ///
    /// Handler errors and panics are logged and counted. A fatal error stops the batch,
    /// leaves the unprocessed events queued and is returned. Returns the number of
    /// events processed.
    pub fn cycle(&self) -> Result<usize> {
        let batch = std::mem::take(&mut *self.shared.lock_incoming());
        if batch.is_empty() {
            return Ok(0);
        }

        let mut processed = 0;
        let mut events = batch.into_iter();
        while let Some(event) = events.next() {
            if let Err(e) = self.process_contained(event) {
                error!(error = %e, "Fatal error in packet handler");
                let mut queue = self.shared.lock_incoming();
                let newer = std::mem::replace(&mut *queue, events.collect());
                queue.extend(newer);
                return Err(e);
            }
            processed += 1;
        }
        trace!(events = processed, "Cycle complete");
        Ok(processed)
    }

    /// [`process`](Self::process) with panics turned into counted handler errors.
    fn process_contained(&self, event: Incoming<S>) -> Result<()> {
        let conn = match &event {
            Incoming::Packet(conn, _) | Incoming::Closed(conn) => conn.id(),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.process(event))) {
            Ok(result) => result,
            Err(_) => {
                self.shared.metrics.handler_error();
                let e = ProtocolError::Handler(constants::ERR_HANDLER_PANICKED.to_string());
                error!(conn = %conn, error = %e, "Packet handler panicked");
                Ok(())
            }
        }
    }

    fn process(&self, event: Incoming<S>) -> Result<()> {
        match event {
            Incoming::Packet(conn, packet) => {
                if conn.is_closed() {
                    trace!(conn = %conn.id(), "Dropping packet for closed connection");
                    return Ok(());
                }
                match packet.handle(&conn, conn.state()) {
                    Ok(()) => self.shared.metrics.packet_dispatched(),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        self.shared.metrics.handler_error();
                        warn!(conn = %conn.id(), error = %e, "Packet handler failed");
                    }
                }
            }
            Incoming::Closed(conn) => {
                let reason = conn.closing_reason().unwrap_or(constants::REASON_DISPOSED);
                debug!(conn = %conn.id(), reason, "Delivering close notification");
                conn.state().on_close(reason);
            }
        }
        Ok(())
    }

    /// Send one group to several connections; it is marked queued for all of them
    /// before the first send starts.
    pub fn broadcast<'a, I>(&self, connections: I, group: &Arc<PacketGroup>)
    where
        I: IntoIterator<Item = &'a Arc<Connection<S>>>,
    {
        if group.is_empty() {
            warn!("Ignoring empty packet group");
            return;
        }
        let targets: Vec<_> = connections
            .into_iter()
            .filter(|conn| !conn.is_closed())
            .cloned()
            .collect();
        for _ in &targets {
            group.enqueue();
        }
        for conn in targets {
            if !self.shared.submit(conn, group.clone()) {
                group.dequeue();
            }
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection<S>>> {
        self.shared.lock_connections().values().cloned().collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<S>>> {
        self.shared.lock_connections().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock_connections().len()
    }

    pub fn protocol(&self) -> &Protocol<S> {
        &self.shared.protocol
    }

    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Close every connection, stop the listeners and join the outgoing workers.
    ///
    /// Close notifications stay queued for the next [`cycle`](Self::cycle); dropping
    /// the core delivers them instead. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if workers.is_empty() {
            return;
        }

        info!(connections = self.connection_count(), "Shutting down async core");
        for conn in self.connections() {
            conn.close(constants::REASON_SHUTDOWN);
        }
        self.shared.shutdown.cancel();

        for tx in &self.shared.outgoing {
            let _ = tx.send(OutgoingJob::Stop);
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("Outgoing worker panicked");
            }
        }
        self.shared.metrics.log_metrics();
    }
}

impl<S: ConnectionState> Drop for AsyncCore<S> {
    fn drop(&mut self) {
        self.shutdown();

        // no cycle() follows; run the close notifications here
        let pending = std::mem::take(&mut *self.shared.lock_incoming());
        for event in pending {
            if let Incoming::Closed(_) = event {
                if let Err(e) = self.process_contained(event) {
                    error!(error = %e, "Close notification failed during drop");
                }
            }
        }
    }
}

fn worker_loop<S: ConnectionState>(index: usize, rx: Receiver<OutgoingJob<S>>) {
    debug!(worker = index, "Outgoing worker started");
    let mut stopping = false;
    while !stopping {
        let Ok(first) = rx.recv() else {
            break;
        };
        for job in std::iter::once(first).chain(rx.try_iter()) {
            match job {
                OutgoingJob::Send(conn, group) => conn.process_sending(&group),
                OutgoingJob::Stop => stopping = true,
            }
        }
    }
    debug!(worker = index, "Outgoing worker stopped");
}
