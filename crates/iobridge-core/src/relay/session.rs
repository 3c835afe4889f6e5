//! Relay connection state machine and socket table.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::socket::{self, Datagram, SocketContext, SocketEvent, Transport, WriteQueue};
use super::{Gauge, GaugeKind, RelayStats};
use crate::auth::SessionToken;
use crate::config::RelayConfig;
use crate::envelope::{Frame, Message, PROTOCOL_VERSION};
use crate::error::{BridgeError, BridgeResult};

/// First id handed to accepted connections; client ids stay below it.
const FIRST_ACCEPTED_ID: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Unauthenticated,
    HelloExchanged,
    Authenticated,
}

enum Flow {
    Continue,
    Close,
}

enum SocketKind {
    Connecting,
    Tcp(WriteQueue<Bytes>),
    Udp {
        queue: WriteQueue<Datagram>,
        socket: Arc<UdpSocket>,
    },
    Listener,
}

impl SocketKind {
    fn label(&self) -> &'static str {
        match self {
            SocketKind::Connecting => "connecting TCP",
            SocketKind::Tcp(_) => "TCP",
            SocketKind::Udp { .. } => "UDP",
            SocketKind::Listener => "TCP listener",
        }
    }
}

/// One row of the socket table. Dropping it aborts the socket's tasks,
/// which closes the OS socket.
struct SocketEntry {
    generation: u64,
    kind: SocketKind,
    tasks: Vec<JoinHandle<()>>,
    _gauge: Gauge,
}

impl Drop for SocketEntry {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One authenticated (or authenticating) relay connection.
///
/// Frames arrive on the channel passed to [`RelaySession::run`]; replies and
/// pushes leave on the `outbound` channel given at construction.
pub struct RelaySession {
    token: SessionToken,
    config: RelayConfig,
    stats: Arc<RelayStats>,
    state: AuthState,
    sockets: HashMap<u32, SocketEntry>,
    outbound: mpsc::Sender<Bytes>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    next_generation: u64,
    next_accepted_id: u32,
    _gauge: Gauge,
}

impl RelaySession {
    pub fn new(
        token: SessionToken,
        config: RelayConfig,
        stats: Arc<RelayStats>,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            token,
            config,
            _gauge: Gauge::new(&stats, GaugeKind::Connection),
            stats,
            state: AuthState::Unauthenticated,
            sockets: HashMap::new(),
            outbound,
            events_tx,
            events_rx,
            next_generation: 1,
            next_accepted_id: FIRST_ACCEPTED_ID,
        }
    }

    /// Drive the connection until the inbound side ends or the protocol
    /// requires closing it. Every socket is closed on return.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Bytes>) {
        debug!("Relay connection opened");
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(bytes) => {
                        if let Flow::Close = self.handle_frame(bytes).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }
        info!(sockets = self.sockets.len(), "Relay connection closed");
        self.sockets.clear();
    }

    async fn send(&self, message: Message, request_id: u32) {
        // A closed outbound side means the connection is going away; the
        // inbound side ends right after.
        let _ = self.outbound.send(message.encode(request_id)).await;
    }

    async fn send_error(&self, request_id: u32, message: impl Into<String>) {
        self.send(
            Message::Error {
                message: message.into(),
            },
            request_id,
        )
        .await;
    }

    async fn handle_frame(&mut self, bytes: Bytes) -> Flow {
        let authenticated = self.state == AuthState::Authenticated;

        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.send_error(0, e.to_string()).await;
                return if authenticated { Flow::Continue } else { Flow::Close };
            }
        };
        let request_id = frame.header.request_id;

        if frame.header.version != PROTOCOL_VERSION {
            warn!(version = frame.header.version, "Unsupported relay protocol version");
            self.send_error(
                request_id,
                format!("unsupported protocol version {}", frame.header.version),
            )
            .await;
            return Flow::Close;
        }

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                self.send_error(request_id, e.to_string()).await;
                return if authenticated { Flow::Continue } else { Flow::Close };
            }
        };

        match (self.state, message) {
            (AuthState::Unauthenticated, Message::ClientHello) => {
                self.state = AuthState::HelloExchanged;
                self.send(Message::ServerHello, request_id).await;
                Flow::Continue
            }
            (AuthState::HelloExchanged, Message::Auth { token, .. }) => {
                if self.token.matches(&token) {
                    self.state = AuthState::Authenticated;
                    info!("Relay connection authenticated");
                    self.send(
                        Message::AuthResult {
                            ok: true,
                            message: None,
                        },
                        request_id,
                    )
                    .await;
                    Flow::Continue
                } else {
                    warn!("Relay authentication failed");
                    self.send(
                        Message::AuthResult {
                            ok: false,
                            message: Some("Invalid token".into()),
                        },
                        request_id,
                    )
                    .await;
                    Flow::Close
                }
            }
            (AuthState::Authenticated, message) => {
                self.handle_socket_op(request_id, message).await;
                Flow::Continue
            }
            (_, Message::Unknown { message_type, .. }) => {
                self.send_error(request_id, format!("Unknown opcode 0x{:02x}", message_type))
                    .await;
                Flow::Close
            }
            (_, message) => {
                debug!(kind = message.message_type().name(), "Rejecting message before authentication");
                self.send_error(request_id, "Authentication required").await;
                Flow::Close
            }
        }
    }

    async fn handle_socket_op(&mut self, request_id: u32, message: Message) {
        match message {
            Message::TcpConnect {
                socket_id,
                port,
                host,
            } => self.tcp_connect(request_id, socket_id, host, port).await,
            Message::TcpSend { socket_id, data } => {
                let len = data.len();
                let result = match self.sockets.get(&socket_id).map(|e| &e.kind) {
                    Some(SocketKind::Tcp(queue)) => queue.push(data, len),
                    Some(other) => Err(BridgeError::Validation(format!(
                        "socket {} is a {} socket",
                        socket_id,
                        other.label()
                    ))),
                    None => Err(BridgeError::NotFound(format!("socket {}", socket_id))),
                };
                if let Err(e) = result {
                    self.send_error(request_id, e.to_string()).await;
                }
            }
            Message::TcpClose { socket_id, .. } => {
                if let Some(entry) = self.sockets.remove(&socket_id) {
                    debug!(socket_id, kind = entry.kind.label(), "Closed by client");
                }
            }
            Message::TcpListen {
                server_id,
                port,
                bind_addr,
            } => self.tcp_listen(request_id, server_id, port, &bind_addr).await,
            Message::TcpStopListen { server_id } => {
                if matches!(
                    self.sockets.get(&server_id).map(|e| &e.kind),
                    Some(SocketKind::Listener)
                ) {
                    self.sockets.remove(&server_id);
                    debug!(server_id, "Listener stopped");
                }
            }
            Message::UdpBind {
                socket_id,
                port,
                bind_addr,
            } => {
                self.udp_bind(request_id, socket_id, port, bind_addr.as_deref())
                    .await
            }
            Message::UdpSend {
                socket_id,
                dest_port,
                dest_addr,
                data,
            } => {
                let len = data.len();
                let result = match self.sockets.get(&socket_id).map(|e| &e.kind) {
                    Some(SocketKind::Udp { queue, .. }) => queue.push(
                        Datagram {
                            host: dest_addr,
                            port: dest_port,
                            data,
                        },
                        len,
                    ),
                    Some(other) => Err(BridgeError::Validation(format!(
                        "socket {} is a {} socket",
                        socket_id,
                        other.label()
                    ))),
                    None => Err(BridgeError::NotFound(format!("socket {}", socket_id))),
                };
                if let Err(e) = result {
                    self.send_error(request_id, e.to_string()).await;
                }
            }
            Message::UdpClose { socket_id, .. } => {
                if self.sockets.remove(&socket_id).is_some() {
                    debug!(socket_id, "UDP socket closed by client");
                }
            }
            Message::UdpJoinMulticast { socket_id, group } => {
                if let Err(e) = self.multicast(socket_id, &group, true) {
                    warn!(socket_id, %group, error = %e, "Multicast join failed");
                    self.send_error(request_id, e.to_string()).await;
                }
            }
            Message::UdpLeaveMulticast { socket_id, group } => {
                if let Err(e) = self.multicast(socket_id, &group, false) {
                    self.send_error(request_id, e.to_string()).await;
                }
            }
            Message::Unknown { message_type, .. } => {
                self.send_error(request_id, format!("Unknown opcode 0x{:02x}", message_type))
                    .await;
            }
            other => {
                self.send_error(
                    request_id,
                    format!("unexpected {} message", other.message_type().name()),
                )
                .await;
            }
        }
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn context(&self, socket_id: u32, generation: u64) -> SocketContext {
        SocketContext {
            socket_id,
            generation,
            outbound: self.outbound.clone(),
            events: self.events_tx.clone(),
            stats: self.stats.clone(),
        }
    }

    async fn tcp_connect(&mut self, request_id: u32, socket_id: u32, host: String, port: u16) {
        if self.sockets.contains_key(&socket_id) {
            warn!(socket_id, "TCP_CONNECT on a socket id already in use");
            self.send(
                Message::TcpConnected {
                    socket_id,
                    ok: false,
                    errno: 0,
                },
                request_id,
            )
            .await;
            return;
        }

        debug!(socket_id, %host, port, "Connecting");
        let generation = self.allocate_generation();
        let task = tokio::spawn(socket::connect_tcp(
            socket_id,
            generation,
            request_id,
            host,
            port,
            self.config.connect_timeout,
            self.events_tx.clone(),
        ));
        self.sockets.insert(
            socket_id,
            SocketEntry {
                generation,
                kind: SocketKind::Connecting,
                tasks: vec![task],
                _gauge: Gauge::new(&self.stats, GaugeKind::Tcp),
            },
        );
    }

    /// Spawn reader and writer for an established stream and return the
    /// write queue plus task handles.
    fn start_tcp(
        &self,
        socket_id: u32,
        generation: u64,
        stream: TcpStream,
    ) -> (WriteQueue<Bytes>, Vec<JoinHandle<()>>) {
        let (read_half, write_half) = stream.into_split();
        let (queue, rx, pending) = WriteQueue::new(self.config.max_pending_write);
        let ctx = self.context(socket_id, generation);
        let reader = tokio::spawn(socket::tcp_reader(
            ctx.clone(),
            read_half,
            self.config.tcp_read_chunk,
        ));
        let writer = tokio::spawn(socket::tcp_writer(ctx, write_half, rx, pending));
        (queue, vec![reader, writer])
    }

    async fn tcp_listen(&mut self, request_id: u32, server_id: u32, port: u16, bind_addr: &str) {
        let failed = |errno| Message::TcpListenResult {
            server_id,
            ok: false,
            bound_port: 0,
            errno,
        };
        if self.sockets.contains_key(&server_id) {
            self.send(failed(0), request_id).await;
            return;
        }
        let ip = match parse_bind_addr(bind_addr) {
            Some(ip) => ip,
            None => {
                self.send_error(request_id, format!("invalid bind address: {}", bind_addr))
                    .await;
                return;
            }
        };
        let listener = match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(server_id, port, error = %e, "Listen failed");
                self.send(failed(BridgeError::from(e).errno()), request_id).await;
                return;
            }
        };
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let generation = self.allocate_generation();
        let task = tokio::spawn(socket::accept_loop(
            server_id,
            generation,
            listener,
            self.events_tx.clone(),
        ));
        self.sockets.insert(
            server_id,
            SocketEntry {
                generation,
                kind: SocketKind::Listener,
                tasks: vec![task],
                _gauge: Gauge::new(&self.stats, GaugeKind::Listener),
            },
        );
        info!(server_id, bound_port, "Listening");
        self.send(
            Message::TcpListenResult {
                server_id,
                ok: true,
                bound_port,
                errno: 0,
            },
            request_id,
        )
        .await;
    }

    async fn udp_bind(
        &mut self,
        request_id: u32,
        socket_id: u32,
        port: u16,
        bind_addr: Option<&str>,
    ) {
        let failed = |errno| Message::UdpBound {
            socket_id,
            ok: false,
            bound_port: 0,
            errno,
        };
        if self.sockets.contains_key(&socket_id) {
            warn!(socket_id, "UDP_BIND on a socket id already in use");
            self.send(failed(0), request_id).await;
            return;
        }
        let ip = match parse_bind_addr(bind_addr.unwrap_or("")) {
            Some(ip) => ip,
            None => {
                self.send(failed(0), request_id).await;
                return;
            }
        };
        let udp = match socket::bind_udp(SocketAddr::new(ip, port)) {
            Ok(udp) => Arc::new(udp),
            Err(e) => {
                warn!(socket_id, port, error = %e, "UDP bind failed");
                self.send(failed(BridgeError::from(e).errno()), request_id).await;
                return;
            }
        };
        let bound_port = udp.local_addr().map(|a| a.port()).unwrap_or(port);

        let generation = self.allocate_generation();
        let (queue, rx, pending) = WriteQueue::new(self.config.max_pending_write);
        let ctx = self.context(socket_id, generation);
        let reader = tokio::spawn(socket::udp_reader(
            ctx.clone(),
            udp.clone(),
            self.config.udp_read_chunk,
        ));
        let writer = tokio::spawn(socket::udp_writer(ctx, udp.clone(), rx, pending));
        self.sockets.insert(
            socket_id,
            SocketEntry {
                generation,
                kind: SocketKind::Udp { queue, socket: udp },
                tasks: vec![reader, writer],
                _gauge: Gauge::new(&self.stats, GaugeKind::Udp),
            },
        );
        debug!(socket_id, bound_port, "UDP bound");
        self.send(
            Message::UdpBound {
                socket_id,
                ok: true,
                bound_port,
                errno: 0,
            },
            request_id,
        )
        .await;
    }

    /// Join or leave an IPv4 multicast group on the default interface.
    fn multicast(&self, socket_id: u32, group: &str, join: bool) -> BridgeResult<()> {
        let socket = match self.sockets.get(&socket_id).map(|e| &e.kind) {
            Some(SocketKind::Udp { socket, .. }) => socket,
            Some(other) => {
                return Err(BridgeError::Validation(format!(
                    "socket {} is a {} socket",
                    socket_id,
                    other.label()
                )))
            }
            None => return Err(BridgeError::NotFound(format!("socket {}", socket_id))),
        };
        let addr: Ipv4Addr = group
            .trim()
            .parse()
            .map_err(|_| BridgeError::Validation(format!("invalid multicast group {:?}", group)))?;
        if !addr.is_multicast() {
            return Err(BridgeError::Validation(format!("{} is not a multicast group", addr)));
        }
        if join {
            socket.join_multicast_v4(addr, Ipv4Addr::UNSPECIFIED)?;
            debug!(socket_id, group = %addr, "Joined multicast group");
        } else {
            socket.leave_multicast_v4(addr, Ipv4Addr::UNSPECIFIED)?;
            debug!(socket_id, group = %addr, "Left multicast group");
        }
        Ok(())
    }

    fn is_current(&self, socket_id: u32, generation: u64) -> bool {
        self.sockets
            .get(&socket_id)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
    }

    async fn handle_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connected {
                socket_id,
                generation,
                request_id,
                stream,
            } => {
                if !self.is_current(socket_id, generation) {
                    return;
                }
                // Reply before the reader starts so TCP_CONNECTED precedes
                // the first TCP_RECV
                self.send(
                    Message::TcpConnected {
                        socket_id,
                        ok: true,
                        errno: 0,
                    },
                    request_id,
                )
                .await;
                let (queue, tasks) = self.start_tcp(socket_id, generation, stream);
                if let Some(entry) = self.sockets.get_mut(&socket_id) {
                    entry.kind = SocketKind::Tcp(queue);
                    entry.tasks = tasks;
                }
                debug!(socket_id, "Connected");
            }
            SocketEvent::ConnectFailed {
                socket_id,
                generation,
                request_id,
                errno,
                reason,
            } => {
                if !self.is_current(socket_id, generation) {
                    return;
                }
                self.sockets.remove(&socket_id);
                debug!(socket_id, errno, %reason, "Connect failed");
                self.send(
                    Message::TcpConnected {
                        socket_id,
                        ok: false,
                        errno,
                    },
                    request_id,
                )
                .await;
            }
            SocketEvent::Accepted {
                server_id,
                generation,
                stream,
                peer,
            } => {
                if !self.is_current(server_id, generation) {
                    return;
                }
                let socket_id = self.allocate_accepted_id();
                let socket_generation = self.allocate_generation();
                // Announce before the reader can push TCP_RECV
                self.send(
                    Message::TcpAccept {
                        server_id,
                        socket_id,
                        remote_port: peer.port(),
                        remote_addr: peer.ip().to_string(),
                    },
                    0,
                )
                .await;
                let (queue, tasks) = self.start_tcp(socket_id, socket_generation, stream);
                self.sockets.insert(
                    socket_id,
                    SocketEntry {
                        generation: socket_generation,
                        kind: SocketKind::Tcp(queue),
                        tasks,
                        _gauge: Gauge::new(&self.stats, GaugeKind::Tcp),
                    },
                );
                debug!(server_id, socket_id, %peer, "Accepted");
            }
            SocketEvent::Closed {
                socket_id,
                generation,
                transport,
                reason,
                errno,
            } => {
                if !self.is_current(socket_id, generation) {
                    return;
                }
                self.sockets.remove(&socket_id);
                debug!(socket_id, ?reason, errno, "Closed by remote");
                let message = match transport {
                    Transport::Tcp => Message::TcpClose {
                        socket_id,
                        reason,
                        errno,
                    },
                    Transport::Udp => Message::UdpClose {
                        socket_id,
                        reason,
                        errno,
                    },
                };
                self.send(message, 0).await;
            }
        }
    }

    fn allocate_accepted_id(&mut self) -> u32 {
        loop {
            let id = self.next_accepted_id;
            self.next_accepted_id = self.next_accepted_id.checked_add(1).unwrap_or(FIRST_ACCEPTED_ID);
            if !self.sockets.contains_key(&id) {
                return id;
            }
        }
    }
}

fn parse_bind_addr(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    addr.trim_start_matches('[').trim_end_matches(']').parse().ok()
}
