//! Socket relay engine
//!
//! One relay connection (a WebSocket in production, plain channels in
//! tests) multiplexes every TCP and UDP socket the extension opens.
//!
//! ## Architecture
//!
//! ```text
//!                 inbound frames                      outbound frames
//!  WebSocket ──> mpsc<Bytes> ──> RelaySession ──> mpsc<Bytes> ──> WebSocket
//!                                  │     ▲                ▲
//!                      spawns      │     │ SocketEvent    │ TCP_RECV / UDP_RECV
//!                                  ▼     │                │
//!                     ┌──────────────────┴────────────────┴───┐
//!                     │ per socket: reader task, writer task  │
//!                     │ (connect / accept tasks while needed) │
//!                     └───────────────────────────────────────┘
//! ```
//!
//! The session loop owns the socket table; nothing else touches it. Socket
//! tasks push received data straight to the outbound queue (so ordering per
//! socket is preserved) and report lifecycle changes back to the session as
//! events tagged with a generation number, which lets the session ignore
//! reports from sockets it already closed.
//! Dropping the session aborts every task it spawned.

mod session;
mod socket;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

pub use session::RelaySession;

/// Process-wide relay counters, exposed at `/stats`.
#[derive(Debug, Default)]
pub struct RelayStats {
    connections: AtomicUsize,
    tcp_sockets: AtomicUsize,
    udp_sockets: AtomicUsize,
    listeners: AtomicUsize,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections: usize,
    pub tcp_sockets: usize,
    pub udp_sockets: usize,
    pub listeners: usize,
    /// Bytes read from remote peers
    pub bytes_received: u64,
    /// Bytes written to remote peers
    pub bytes_sent: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            tcp_sockets: self.tcp_sockets.load(Ordering::Relaxed),
            udp_sockets: self.udp_sockets.load(Ordering::Relaxed),
            listeners: self.listeners.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Which gauge a [`Gauge`] guard counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GaugeKind {
    Connection,
    Tcp,
    Udp,
    Listener,
}

/// Increments a gauge on creation and decrements it on drop.
#[derive(Debug)]
pub(crate) struct Gauge {
    stats: Arc<RelayStats>,
    kind: GaugeKind,
}

impl Gauge {
    pub(crate) fn new(stats: &Arc<RelayStats>, kind: GaugeKind) -> Self {
        stats.counter(kind).fetch_add(1, Ordering::Relaxed);
        Self {
            stats: stats.clone(),
            kind,
        }
    }
}

impl Drop for Gauge {
    fn drop(&mut self) {
        self.stats.counter(self.kind).fetch_sub(1, Ordering::Relaxed);
    }
}

impl RelayStats {
    fn counter(&self, kind: GaugeKind) -> &AtomicUsize {
        match kind {
            GaugeKind::Connection => &self.connections,
            GaugeKind::Tcp => &self.tcp_sockets,
            GaugeKind::Udp => &self.udp_sockets,
            GaugeKind::Listener => &self.listeners,
        }
    }
}
