//! Observability and Metrics
//!
//! Counters describing the traffic through one [`AsyncCore`](crate::transport::core::AsyncCore).
//!
//! Uses atomic counters for thread-safe metrics collection: I/O tasks, worker threads
//! and the main loop all record into the same instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for engine operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Packets decoded successfully by the framing loop
    pub packets_received: AtomicU64,
    /// Packets whose handler ran on the main loop
    pub packets_dispatched: AtomicU64,
    /// Packets dropped (discarded or registered as ignored)
    pub packets_discarded: AtomicU64,
    /// Packets with an id missing from the protocol table
    pub packets_unknown: AtomicU64,
    /// Handlers that returned an error
    pub handler_errors: AtomicU64,
    /// Packet groups handed to a socket writer
    pub groups_sent: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_received: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Connections closed because of an error
    pub connection_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_dispatched: AtomicU64::new(0),
            packets_discarded: AtomicU64::new(0),
            packets_unknown: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            groups_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a packet decoded by the framing loop
    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet handled on the main loop
    pub fn packet_dispatched(&self) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a discarded packet
    pub fn packet_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unknown packet id
    pub fn packet_unknown(&self) {
        self.packets_unknown.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handler
    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet group handed to a socket writer
    pub fn group_sent(&self) {
        self.groups_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes read from a socket
    pub fn bytes_in(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record bytes written to a socket
    pub fn bytes_out(&self, byte_count: u64) {
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a connection error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
            packets_unknown: self.packets_unknown.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            groups_sent: self.groups_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            packets_received = snapshot.packets_received,
            packets_dispatched = snapshot.packets_dispatched,
            packets_discarded = snapshot.packets_discarded,
            packets_unknown = snapshot.packets_unknown,
            handler_errors = snapshot.handler_errors,
            groups_sent = snapshot.groups_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            connection_errors = snapshot.connection_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Engine metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub packets_received: u64,
    pub packets_dispatched: u64,
    pub packets_discarded: u64,
    pub packets_unknown: u64,
    pub handler_errors: u64,
    pub groups_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connection_errors: u64,
    pub uptime_seconds: u64,
}
