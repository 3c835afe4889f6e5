//! Socket relay integration tests
//!
//! Each test drives a [`RelaySession`] over in-memory channels, exactly as
//! the WebSocket transport does, against real loopback TCP/UDP peers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use iobridge_core::envelope::CloseReason;
use iobridge_core::{Frame, Message, RelayConfig, RelaySession, RelayStats, SessionToken};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TOKEN: &str = "relay-test-token";
const WAIT: Duration = Duration::from_secs(5);

struct Client {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    stats: Arc<RelayStats>,
    next_rid: u32,
}

impl Client {
    fn start() -> Self {
        Self::with_config(RelayConfig::default())
    }

    fn with_config(config: RelayConfig) -> Self {
        let (tx, in_rx) = mpsc::channel(64);
        let (out_tx, rx) = mpsc::channel(64);
        let stats = Arc::new(RelayStats::default());
        let session = RelaySession::new(
            SessionToken::from(TOKEN.to_string()),
            config,
            stats.clone(),
            out_tx,
        );
        tokio::spawn(session.run(in_rx));
        Self {
            tx,
            rx,
            stats,
            next_rid: 1,
        }
    }

    /// Start a session and complete the hello/auth exchange.
    async fn authenticated() -> Self {
        Self::authenticated_with(RelayConfig::default()).await
    }

    async fn authenticated_with(config: RelayConfig) -> Self {
        let mut client = Self::with_config(config);
        client.send(Message::ClientHello).await;
        assert_eq!(client.recv().await, Message::ServerHello);
        client
            .send(Message::Auth {
                auth_type: 1,
                token: TOKEN.to_string(),
            })
            .await;
        assert_eq!(
            client.recv().await,
            Message::AuthResult {
                ok: true,
                message: None
            }
        );
        client
    }

    async fn send(&mut self, message: Message) -> u32 {
        let rid = self.next_rid;
        self.next_rid += 1;
        self.tx.send(message.encode(rid)).await.unwrap();
        rid
    }

    async fn recv_with_rid(&mut self) -> (u32, Message) {
        let bytes = timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a relay frame")
            .expect("relay connection closed");
        let frame = Frame::decode(bytes).unwrap();
        (frame.header.request_id, Message::decode(&frame).unwrap())
    }

    async fn recv(&mut self) -> Message {
        self.recv_with_rid().await.1
    }

    /// Collect TCP_RECV data for `socket_id` until `expected` bytes arrived.
    async fn recv_tcp(&mut self, socket_id: u32, expected: usize) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < expected {
            match self.recv().await {
                Message::TcpRecv { socket_id: id, data } if id == socket_id => {
                    received.extend_from_slice(&data)
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        received
    }
}

async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    (port, task)
}

#[tokio::test]
async fn test_tcp_echo_scenario() {
    let (port, _server) = echo_server().await;
    let mut client = Client::authenticated().await;

    let rid = client
        .send(Message::TcpConnect {
            socket_id: 7,
            port,
            host: "127.0.0.1".into(),
        })
        .await;
    assert_eq!(
        client.recv_with_rid().await,
        (
            rid,
            Message::TcpConnected {
                socket_id: 7,
                ok: true,
                errno: 0
            }
        )
    );
    assert_eq!(client.stats.snapshot().tcp_sockets, 1);

    for chunk in ["hello ", "relay ", "world"] {
        client
            .send(Message::TcpSend {
                socket_id: 7,
                data: Bytes::from(chunk),
            })
            .await;
    }
    let echoed = client.recv_tcp(7, "hello relay world".len()).await;
    assert_eq!(echoed, b"hello relay world");

    client
        .send(Message::TcpClose {
            socket_id: 7,
            reason: CloseReason::Normal,
            errno: 0,
        })
        .await;

    // The id is free again once closed
    let (port, _server) = echo_server().await;
    client
        .send(Message::TcpConnect {
            socket_id: 7,
            port,
            host: "127.0.0.1".into(),
        })
        .await;
    assert!(matches!(
        client.recv().await,
        Message::TcpConnected { socket_id: 7, ok: true, .. }
    ));
}

#[tokio::test]
async fn test_large_transfer_keeps_order() {
    let (port, _server) = echo_server().await;
    let mut client = Client::authenticated().await;
    client
        .send(Message::TcpConnect {
            socket_id: 1,
            port,
            host: "localhost".into(),
        })
        .await;
    assert!(matches!(client.recv().await, Message::TcpConnected { ok: true, .. }));

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(16 * 1024) {
        client
            .send(Message::TcpSend {
                socket_id: 1,
                data: Bytes::copy_from_slice(chunk),
            })
            .await;
    }
    let echoed = client.recv_tcp(1, payload.len()).await;
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_duplicate_connect_is_rejected() {
    let (port, _server) = echo_server().await;
    let mut client = Client::authenticated().await;
    client
        .send(Message::TcpConnect {
            socket_id: 3,
            port,
            host: "127.0.0.1".into(),
        })
        .await;
    assert!(matches!(client.recv().await, Message::TcpConnected { ok: true, .. }));

    client
        .send(Message::TcpConnect {
            socket_id: 3,
            port,
            host: "127.0.0.1".into(),
        })
        .await;
    assert!(matches!(
        client.recv().await,
        Message::TcpConnected { socket_id: 3, ok: false, .. }
    ));
}

#[tokio::test]
async fn test_connect_refused_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut client = Client::authenticated().await;
    client
        .send(Message::TcpConnect {
            socket_id: 2,
            port,
            host: "127.0.0.1".into(),
        })
        .await;
    assert!(matches!(
        client.recv().await,
        Message::TcpConnected { socket_id: 2, ok: false, .. }
    ));
    assert_eq!(client.stats.snapshot().tcp_sockets, 0);
}

#[tokio::test]
async fn test_remote_close_is_pushed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"bye").await.unwrap();
    });

    let mut client = Client::authenticated().await;
    client
        .send(Message::TcpConnect {
            socket_id: 5,
            port,
            host: "127.0.0.1".into(),
        })
        .await;
    assert!(matches!(client.recv().await, Message::TcpConnected { ok: true, .. }));
    assert_eq!(client.recv_tcp(5, 3).await, b"bye");
    assert_eq!(
        client.recv_with_rid().await,
        (
            0,
            Message::TcpClose {
                socket_id: 5,
                reason: CloseReason::Normal,
                errno: 0
            }
        )
    );

    // The socket is gone from the table
    client
        .send(Message::TcpSend {
            socket_id: 5,
            data: Bytes::from_static(b"x"),
        })
        .await;
    assert!(matches!(client.recv().await, Message::Error { .. }));
}

#[tokio::test]
async fn test_dropping_connection_closes_sockets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (peer_tx, peer_rx) = tokio::sync::oneshot::channel::<TcpStream>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = peer_tx.send(stream);
    });

    let mut client = Client::authenticated().await;
    client
        .send(Message::TcpConnect {
            socket_id: 1,
            port,
            host: "127.0.0.1".into(),
        })
        .await;
    assert!(matches!(client.recv().await, Message::TcpConnected { ok: true, .. }));
    let mut peer = timeout(WAIT, peer_rx).await.unwrap().unwrap();

    let stats = client.stats.clone();
    let Client { tx, mut rx, .. } = client;
    drop(tx);
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());

    // The peer sees end-of-stream
    let mut buf = [0u8; 8];
    let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.tcp_sockets, 0);
    assert_eq!(snapshot.connections, 0);
}

#[tokio::test]
async fn test_udp_round_trip() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        peer.send_to(&buf[..n], from).await.unwrap();
    });

    let mut client = Client::authenticated().await;
    client
        .send(Message::UdpBind {
            socket_id: 11,
            port: 0,
            bind_addr: Some("127.0.0.1".into()),
        })
        .await;
    let bound_port = match client.recv().await {
        Message::UdpBound {
            socket_id: 11,
            ok: true,
            bound_port,
            errno: 0,
        } => bound_port,
        other => panic!("unexpected frame: {:?}", other),
    };
    assert_ne!(bound_port, 0);

    client
        .send(Message::UdpSend {
            socket_id: 11,
            dest_port: peer_port,
            dest_addr: "127.0.0.1".into(),
            data: Bytes::from_static(b"d1:ad2:id20:"),
        })
        .await;
    assert_eq!(
        client.recv().await,
        Message::UdpRecv {
            socket_id: 11,
            src_port: peer_port,
            src_addr: "127.0.0.1".into(),
            data: Bytes::from_static(b"d1:ad2:id20:"),
        }
    );

    client
        .send(Message::UdpClose {
            socket_id: 11,
            reason: CloseReason::Normal,
            errno: 0,
        })
        .await;
    // Sending on a closed id is an error but the connection stays up
    client
        .send(Message::UdpSend {
            socket_id: 11,
            dest_port: peer_port,
            dest_addr: "127.0.0.1".into(),
            data: Bytes::from_static(b"x"),
        })
        .await;
    assert!(matches!(client.recv().await, Message::Error { .. }));
}

#[tokio::test]
async fn test_listen_and_accept() {
    let mut client = Client::authenticated().await;
    client
        .send(Message::TcpListen {
            server_id: 9,
            port: 0,
            bind_addr: "127.0.0.1".into(),
        })
        .await;
    let bound_port = match client.recv().await {
        Message::TcpListenResult {
            server_id: 9,
            ok: true,
            bound_port,
            ..
        } => bound_port,
        other => panic!("unexpected frame: {:?}", other),
    };

    let mut remote = TcpStream::connect(("127.0.0.1", bound_port)).await.unwrap();
    remote.write_all(b"ping").await.unwrap();

    let accepted = match client.recv().await {
        Message::TcpAccept {
            server_id: 9,
            socket_id,
            remote_addr,
            ..
        } => {
            assert_eq!(remote_addr, "127.0.0.1");
            socket_id
        }
        other => panic!("unexpected frame: {:?}", other),
    };
    assert!(accepted >= 0x8000_0000);
    assert_eq!(client.recv_tcp(accepted, 4).await, b"ping");

    client
        .send(Message::TcpSend {
            socket_id: accepted,
            data: Bytes::from_static(b"pong"),
        })
        .await;
    let mut buf = [0u8; 4];
    timeout(WAIT, remote.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"pong");

    client.send(Message::TcpStopListen { server_id: 9 }).await;
    assert_eq!(client.stats.snapshot().tcp_sockets, 1);
}

/// A listener whose accept queue is full drops further SYNs, so connects hang.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_connect_timeout_reports_etimedout() {
    use socket2::{Domain, Socket, Type};

    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let mut backlog = Vec::new();
    for _ in 0..4 {
        if let Ok(Ok(stream)) = timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            backlog.push(stream);
        }
    }

    let config = RelayConfig {
        connect_timeout: Duration::from_millis(300),
        ..RelayConfig::default()
    };
    let mut client = Client::authenticated_with(config).await;
    let rid = client
        .send(Message::TcpConnect {
            socket_id: 4,
            port: addr.port(),
            host: "127.0.0.1".into(),
        })
        .await;
    assert_eq!(
        client.recv_with_rid().await,
        (
            rid,
            Message::TcpConnected {
                socket_id: 4,
                ok: false,
                errno: libc::ETIMEDOUT as u32,
            }
        )
    );
    assert_eq!(client.stats.snapshot().tcp_sockets, 0);
    drop(backlog);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropping_connection_frees_udp_port() {
    let mut client = Client::authenticated().await;
    client
        .send(Message::UdpBind {
            socket_id: 2,
            port: 0,
            bind_addr: Some("127.0.0.1".into()),
        })
        .await;
    let port = match client.recv().await {
        Message::UdpBound {
            ok: true, bound_port, ..
        } => bound_port,
        other => panic!("unexpected frame: {:?}", other),
    };
    // A plain bind (no SO_REUSEADDR) conflicts while the relay holds the port
    assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_err());

    let stats = client.stats.clone();
    let Client { tx, mut rx, .. } = client;
    drop(tx);
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());

    let rebound = async {
        loop {
            if let Ok(socket) = std::net::UdpSocket::bind(("127.0.0.1", port)) {
                return socket;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(WAIT, rebound).await.expect("UDP port still held");
    assert_eq!(stats.snapshot().udp_sockets, 0);
}
