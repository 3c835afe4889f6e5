//! Per-socket tasks: connecting, reading, writing and accepting.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::RelayStats;
use crate::envelope::{CloseReason, Message};
use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Tcp,
    Udp,
}

/// Lifecycle reports from socket tasks back to the owning session.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Connected {
        socket_id: u32,
        generation: u64,
        request_id: u32,
        stream: TcpStream,
    },
    ConnectFailed {
        socket_id: u32,
        generation: u64,
        request_id: u32,
        errno: u32,
        reason: String,
    },
    Accepted {
        server_id: u32,
        generation: u64,
        stream: TcpStream,
        peer: SocketAddr,
    },
    Closed {
        socket_id: u32,
        generation: u64,
        transport: Transport,
        reason: CloseReason,
        errno: u32,
    },
}

/// One outgoing UDP datagram.
#[derive(Debug)]
pub(crate) struct Datagram {
    pub host: String,
    pub port: u16,
    pub data: Bytes,
}

/// Sending side of a socket's write queue, bounded by queued bytes.
#[derive(Debug)]
pub(crate) struct WriteQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    pending: Arc<AtomicUsize>,
    limit: usize,
}

impl<T> WriteQueue<T> {
    pub(crate) fn new(limit: usize) -> (Self, mpsc::UnboundedReceiver<T>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                pending: pending.clone(),
                limit,
            },
            rx,
            pending,
        )
    }

    /// Queue `item` (`len` bytes), or reject it when the queue already
    /// holds too much. An empty queue always accepts one item.
    pub(crate) fn push(&self, item: T, len: usize) -> BridgeResult<()> {
        let before = self.pending.fetch_add(len, Ordering::AcqRel);
        if before > 0 && before + len > self.limit {
            self.pending.fetch_sub(len, Ordering::AcqRel);
            return Err(BridgeError::Backpressure(format!(
                "{} bytes already queued",
                before
            )));
        }
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(len, Ordering::AcqRel);
            return Err(BridgeError::NotFound("socket writer has stopped".into()));
        }
        Ok(())
    }
}

/// Handles shared by the tasks of one socket.
#[derive(Debug, Clone)]
pub(crate) struct SocketContext {
    pub socket_id: u32,
    pub generation: u64,
    pub outbound: mpsc::Sender<Bytes>,
    pub events: mpsc::UnboundedSender<SocketEvent>,
    pub stats: Arc<RelayStats>,
}

impl SocketContext {
    fn closed(&self, transport: Transport, reason: CloseReason, errno: u32) {
        let _ = self.events.send(SocketEvent::Closed {
            socket_id: self.socket_id,
            generation: self.generation,
            transport,
            reason,
            errno,
        });
    }
}

/// errno reported when a connect attempt outlives its timeout
pub(crate) const TIMED_OUT_ERRNO: u32 = libc::ETIMEDOUT as u32;

fn errno_of(e: &std::io::Error) -> u32 {
    e.raw_os_error().map(|c| c as u32).unwrap_or(0)
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

pub(crate) async fn connect_tcp(
    socket_id: u32,
    generation: u64,
    request_id: u32,
    host: String,
    port: u16,
    timeout: Duration,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let target = (strip_brackets(&host), port);
    let event = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            SocketEvent::Connected {
                socket_id,
                generation,
                request_id,
                stream,
            }
        }
        Ok(Err(e)) => SocketEvent::ConnectFailed {
            socket_id,
            generation,
            request_id,
            errno: errno_of(&e),
            reason: e.to_string(),
        },
        Err(_) => SocketEvent::ConnectFailed {
            socket_id,
            generation,
            request_id,
            errno: TIMED_OUT_ERRNO,
            reason: format!("connect timed out after {:?}", timeout),
        },
    };
    let _ = events.send(event);
}

/// Bind a UDP socket with `SO_REUSEADDR`, so a page reload can bind the
/// same port (e.g. 6771 for local peer discovery) while the old socket is
/// still being torn down.
pub(crate) fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

pub(crate) async fn tcp_reader(ctx: SocketContext, mut half: OwnedReadHalf, chunk: usize) {
    let mut buf = vec![0u8; chunk];
    let (reason, errno) = loop {
        match half.read(&mut buf).await {
            Ok(0) => break (CloseReason::Normal, 0),
            Ok(n) => {
                ctx.stats.record_received(n);
                let frame = Message::TcpRecv {
                    socket_id: ctx.socket_id,
                    data: Bytes::copy_from_slice(&buf[..n]),
                }
                .encode(0);
                // Waiting here is the back-pressure towards the remote peer
                if ctx.outbound.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(socket_id = ctx.socket_id, error = %e, "TCP read failed");
                break (CloseReason::Error, errno_of(&e));
            }
        }
    };
    ctx.closed(Transport::Tcp, reason, errno);
}

pub(crate) async fn tcp_writer(
    ctx: SocketContext,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(data) = rx.recv().await {
        let result = half.write_all(&data).await;
        pending.fetch_sub(data.len(), Ordering::AcqRel);
        match result {
            Ok(()) => ctx.stats.record_sent(data.len()),
            Err(e) => {
                debug!(socket_id = ctx.socket_id, error = %e, "TCP write failed");
                ctx.closed(Transport::Tcp, CloseReason::Error, errno_of(&e));
                return;
            }
        }
    }
}

pub(crate) async fn udp_reader(ctx: SocketContext, socket: Arc<UdpSocket>, chunk: usize) {
    let mut buf = vec![0u8; chunk];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                ctx.stats.record_received(n);
                let frame = Message::UdpRecv {
                    socket_id: ctx.socket_id,
                    src_port: from.port(),
                    src_addr: from.ip().to_string(),
                    data: Bytes::copy_from_slice(&buf[..n]),
                }
                .encode(0);
                if ctx.outbound.send(frame).await.is_err() {
                    return;
                }
            }
            // ICMP port-unreachable from an earlier send; the socket is fine
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                trace!(socket_id = ctx.socket_id, "Ignoring UDP connection reset");
            }
            Err(e) => {
                warn!(socket_id = ctx.socket_id, error = %e, "UDP receive failed");
                ctx.closed(Transport::Udp, CloseReason::Error, errno_of(&e));
                return;
            }
        }
    }
}

pub(crate) async fn udp_writer(
    ctx: SocketContext,
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Datagram>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(datagram) = rx.recv().await {
        let len = datagram.data.len();
        let target = (strip_brackets(&datagram.host), datagram.port);
        let result = socket.send_to(&datagram.data, target).await;
        pending.fetch_sub(len, Ordering::AcqRel);
        match result {
            Ok(_) => ctx.stats.record_sent(len),
            // A failed datagram does not close the socket
            Err(e) => debug!(
                socket_id = ctx.socket_id,
                host = %datagram.host,
                port = datagram.port,
                error = %e,
                "UDP send failed"
            ),
        }
    }
}

pub(crate) async fn accept_loop(
    server_id: u32,
    generation: u64,
    listener: TcpListener,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let event = SocketEvent::Accepted {
                    server_id,
                    generation,
                    stream,
                    peer,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(server_id, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
