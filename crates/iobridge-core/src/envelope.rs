//! Binary envelope codec for the socket relay
//!
//! Every relay frame starts with a fixed 8-byte header followed by a
//! payload whose length is implied by the transport frame (one WebSocket
//! binary message carries exactly one envelope).
//!
//! ## Wire Format
//!
//! ```text
//! +---------+------+--------+------------+-----------------+
//! | version | type | flags  | request_id | payload         |
//! | (u8)    | (u8) | (u16)  | (u32)      | (variable)      |
//! +---------+------+--------+------------+-----------------+
//!   byte 0    1      2..4     4..8         8..
//! ```
//!
//! All integers are little-endian. `flags` is reserved and always zero on
//! frames we emit. Unsolicited pushes (TCP_RECV, UDP_RECV, host-initiated
//! closes, TCP_ACCEPT) carry request id 0.
//!
//! Decoding is split in two steps: [`Frame::decode`] only needs the header,
//! so an unknown message type still yields a frame the relay can answer
//! with ERROR. [`Message::decode`] then interprets the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, BridgeResult};

/// Current relay protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed envelope header
pub const HEADER_LEN: usize = 8;

/// Status byte for a successful connect/bind/auth
pub const STATUS_OK: u8 = 0;

/// Status byte for a failed connect/bind/auth
pub const STATUS_FAILED: u8 = 1;

/// Relay message type (byte 1 of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ClientHello,
    ServerHello,
    Auth,
    AuthResult,
    Error,
    TcpConnect,
    TcpConnected,
    TcpSend,
    TcpRecv,
    TcpClose,
    TcpListen,
    TcpListenResult,
    TcpAccept,
    TcpStopListen,
    UdpBind,
    UdpBound,
    UdpSend,
    UdpRecv,
    UdpClose,
    UdpJoinMulticast,
    UdpLeaveMulticast,
    Unknown(u8),
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => MessageType::ClientHello,
            0x02 => MessageType::ServerHello,
            0x03 => MessageType::Auth,
            0x04 => MessageType::AuthResult,
            0x7F => MessageType::Error,
            0x10 => MessageType::TcpConnect,
            0x11 => MessageType::TcpConnected,
            0x12 => MessageType::TcpSend,
            0x13 => MessageType::TcpRecv,
            0x14 => MessageType::TcpClose,
            0x15 => MessageType::TcpListen,
            0x16 => MessageType::TcpListenResult,
            0x17 => MessageType::TcpAccept,
            0x18 => MessageType::TcpStopListen,
            0x20 => MessageType::UdpBind,
            0x21 => MessageType::UdpBound,
            0x22 => MessageType::UdpSend,
            0x23 => MessageType::UdpRecv,
            0x24 => MessageType::UdpClose,
            0x25 => MessageType::UdpJoinMulticast,
            0x26 => MessageType::UdpLeaveMulticast,
            other => MessageType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::ClientHello => 0x01,
            MessageType::ServerHello => 0x02,
            MessageType::Auth => 0x03,
            MessageType::AuthResult => 0x04,
            MessageType::Error => 0x7F,
            MessageType::TcpConnect => 0x10,
            MessageType::TcpConnected => 0x11,
            MessageType::TcpSend => 0x12,
            MessageType::TcpRecv => 0x13,
            MessageType::TcpClose => 0x14,
            MessageType::TcpListen => 0x15,
            MessageType::TcpListenResult => 0x16,
            MessageType::TcpAccept => 0x17,
            MessageType::TcpStopListen => 0x18,
            MessageType::UdpBind => 0x20,
            MessageType::UdpBound => 0x21,
            MessageType::UdpSend => 0x22,
            MessageType::UdpRecv => 0x23,
            MessageType::UdpClose => 0x24,
            MessageType::UdpJoinMulticast => 0x25,
            MessageType::UdpLeaveMulticast => 0x26,
            MessageType::Unknown(other) => other,
        }
    }

    /// Short name used in error messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::ClientHello => "CLIENT_HELLO",
            MessageType::ServerHello => "SERVER_HELLO",
            MessageType::Auth => "AUTH",
            MessageType::AuthResult => "AUTH_RESULT",
            MessageType::Error => "ERROR",
            MessageType::TcpConnect => "TCP_CONNECT",
            MessageType::TcpConnected => "TCP_CONNECTED",
            MessageType::TcpSend => "TCP_SEND",
            MessageType::TcpRecv => "TCP_RECV",
            MessageType::TcpClose => "TCP_CLOSE",
            MessageType::TcpListen => "TCP_LISTEN",
            MessageType::TcpListenResult => "TCP_LISTEN_RESULT",
            MessageType::TcpAccept => "TCP_ACCEPT",
            MessageType::TcpStopListen => "TCP_STOP_LISTEN",
            MessageType::UdpBind => "UDP_BIND",
            MessageType::UdpBound => "UDP_BOUND",
            MessageType::UdpSend => "UDP_SEND",
            MessageType::UdpRecv => "UDP_RECV",
            MessageType::UdpClose => "UDP_CLOSE",
            MessageType::UdpJoinMulticast => "UDP_JOIN_MULTICAST",
            MessageType::UdpLeaveMulticast => "UDP_LEAVE_MULTICAST",
            MessageType::Unknown(_) => "UNKNOWN",
        }
    }
}

/// The fixed 8-byte envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: MessageType,
    /// Reserved
    pub flags: u16,
    pub request_id: u32,
}

impl Header {
    pub fn new(message_type: MessageType, request_id: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            flags: 0,
            request_id,
        }
    }

    /// Decode the header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::MalformedEnvelope`] when fewer than 8 bytes are given.
    pub fn decode(mut bytes: &[u8]) -> BridgeResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(BridgeError::MalformedEnvelope(bytes.len()));
        }
        let version = bytes.get_u8();
        let message_type = MessageType::from_u8(bytes.get_u8());
        let flags = bytes.get_u16_le();
        let request_id = bytes.get_u32_le();
        Ok(Self {
            version,
            message_type,
            flags,
            request_id,
        })
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.message_type.as_u8());
        buf.put_u16_le(self.flags);
        buf.put_u32_le(self.request_id);
    }
}

/// One decoded envelope: header plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn decode(mut bytes: Bytes) -> BridgeResult<Self> {
        let header = Header::decode(&bytes)?;
        bytes.advance(HEADER_LEN);
        Ok(Self {
            header,
            payload: bytes,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Why a socket was closed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    Error,
}

impl CloseReason {
    fn from_u8(value: u8) -> Self {
        if value == 0 {
            CloseReason::Normal
        } else {
            CloseReason::Error
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::Error => 1,
        }
    }
}

/// A relay message with its payload interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ClientHello,
    ServerHello,
    Auth {
        auth_type: u8,
        token: String,
    },
    AuthResult {
        ok: bool,
        message: Option<String>,
    },
    Error {
        message: String,
    },
    TcpConnect {
        socket_id: u32,
        port: u16,
        host: String,
    },
    TcpConnected {
        socket_id: u32,
        ok: bool,
        errno: u32,
    },
    TcpSend {
        socket_id: u32,
        data: Bytes,
    },
    TcpRecv {
        socket_id: u32,
        data: Bytes,
    },
    TcpClose {
        socket_id: u32,
        reason: CloseReason,
        errno: u32,
    },
    TcpListen {
        server_id: u32,
        port: u16,
        bind_addr: String,
    },
    TcpListenResult {
        server_id: u32,
        ok: bool,
        bound_port: u16,
        errno: u32,
    },
    TcpAccept {
        server_id: u32,
        socket_id: u32,
        remote_port: u16,
        remote_addr: String,
    },
    TcpStopListen {
        server_id: u32,
    },
    UdpBind {
        socket_id: u32,
        port: u16,
        bind_addr: Option<String>,
    },
    UdpBound {
        socket_id: u32,
        ok: bool,
        bound_port: u16,
        errno: u32,
    },
    UdpSend {
        socket_id: u32,
        dest_port: u16,
        dest_addr: String,
        data: Bytes,
    },
    UdpRecv {
        socket_id: u32,
        src_port: u16,
        src_addr: String,
        data: Bytes,
    },
    UdpClose {
        socket_id: u32,
        reason: CloseReason,
        errno: u32,
    },
    /// Join an IPv4 multicast group on a bound UDP socket
    UdpJoinMulticast {
        socket_id: u32,
        group: String,
    },
    UdpLeaveMulticast {
        socket_id: u32,
        group: String,
    },
    Unknown {
        message_type: u8,
        payload: Bytes,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ClientHello => MessageType::ClientHello,
            Message::ServerHello => MessageType::ServerHello,
            Message::Auth { .. } => MessageType::Auth,
            Message::AuthResult { .. } => MessageType::AuthResult,
            Message::Error { .. } => MessageType::Error,
            Message::TcpConnect { .. } => MessageType::TcpConnect,
            Message::TcpConnected { .. } => MessageType::TcpConnected,
            Message::TcpSend { .. } => MessageType::TcpSend,
            Message::TcpRecv { .. } => MessageType::TcpRecv,
            Message::TcpClose { .. } => MessageType::TcpClose,
            Message::TcpListen { .. } => MessageType::TcpListen,
            Message::TcpListenResult { .. } => MessageType::TcpListenResult,
            Message::TcpAccept { .. } => MessageType::TcpAccept,
            Message::TcpStopListen { .. } => MessageType::TcpStopListen,
            Message::UdpBind { .. } => MessageType::UdpBind,
            Message::UdpBound { .. } => MessageType::UdpBound,
            Message::UdpSend { .. } => MessageType::UdpSend,
            Message::UdpRecv { .. } => MessageType::UdpRecv,
            Message::UdpClose { .. } => MessageType::UdpClose,
            Message::UdpJoinMulticast { .. } => MessageType::UdpJoinMulticast,
            Message::UdpLeaveMulticast { .. } => MessageType::UdpLeaveMulticast,
            Message::Unknown { message_type, .. } => MessageType::Unknown(*message_type),
        }
    }

    /// Interpret a frame's payload according to its message type.
    pub fn decode(frame: &Frame) -> BridgeResult<Self> {
        let kind = frame.header.message_type;
        let mut r = PayloadReader::new(kind.name(), frame.payload.clone());

        let message = match kind {
            MessageType::ClientHello => Message::ClientHello,
            MessageType::ServerHello => Message::ServerHello,
            MessageType::Auth => {
                let auth_type = r.u8()?;
                let token = match auth_type {
                    // NUL-terminated token, optionally followed by
                    // extensionId\0installId which the relay does not use
                    0 => {
                        let rest = r.rest();
                        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
                        utf8(kind.name(), &rest[..end])?
                    }
                    1 => r.rest_str()?,
                    other => {
                        return Err(BridgeError::Protocol(format!(
                            "unsupported auth type {}",
                            other
                        )))
                    }
                };
                Message::Auth { auth_type, token }
            }
            MessageType::AuthResult => {
                let ok = r.u8()? == STATUS_OK;
                let rest = r.rest();
                let message = if rest.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&rest).into_owned())
                };
                Message::AuthResult { ok, message }
            }
            MessageType::Error => Message::Error {
                message: String::from_utf8_lossy(&r.rest()).into_owned(),
            },
            MessageType::TcpConnect => Message::TcpConnect {
                socket_id: r.u32()?,
                port: r.u16()?,
                host: r.rest_str()?,
            },
            MessageType::TcpConnected => Message::TcpConnected {
                socket_id: r.u32()?,
                ok: r.u8()? == STATUS_OK,
                errno: r.u32_or_zero(),
            },
            MessageType::TcpSend => Message::TcpSend {
                socket_id: r.u32()?,
                data: r.rest(),
            },
            MessageType::TcpRecv => Message::TcpRecv {
                socket_id: r.u32()?,
                data: r.rest(),
            },
            MessageType::TcpClose => Message::TcpClose {
                socket_id: r.u32()?,
                reason: CloseReason::from_u8(r.u8_or_zero()),
                errno: r.u32_or_zero(),
            },
            MessageType::TcpListen => Message::TcpListen {
                server_id: r.u32()?,
                port: r.u16()?,
                bind_addr: r.rest_str()?,
            },
            MessageType::TcpListenResult => Message::TcpListenResult {
                server_id: r.u32()?,
                ok: r.u8()? == STATUS_OK,
                bound_port: r.u16()?,
                errno: r.u32_or_zero(),
            },
            MessageType::TcpAccept => Message::TcpAccept {
                server_id: r.u32()?,
                socket_id: r.u32()?,
                remote_port: r.u16()?,
                remote_addr: r.rest_str()?,
            },
            MessageType::TcpStopListen => Message::TcpStopListen {
                server_id: r.u32()?,
            },
            MessageType::UdpBind => {
                let socket_id = r.u32()?;
                let port = r.u16()?;
                let addr = r.rest_str()?;
                Message::UdpBind {
                    socket_id,
                    port,
                    bind_addr: if addr.is_empty() { None } else { Some(addr) },
                }
            }
            MessageType::UdpBound => Message::UdpBound {
                socket_id: r.u32()?,
                ok: r.u8()? == STATUS_OK,
                bound_port: r.u16_or_zero(),
                errno: r.u32_or_zero(),
            },
            MessageType::UdpSend => {
                let socket_id = r.u32()?;
                let dest_port = r.u16()?;
                let dest_addr = r.prefixed_str()?;
                Message::UdpSend {
                    socket_id,
                    dest_port,
                    dest_addr,
                    data: r.rest(),
                }
            }
            MessageType::UdpRecv => {
                let socket_id = r.u32()?;
                let src_port = r.u16()?;
                let src_addr = r.prefixed_str()?;
                Message::UdpRecv {
                    socket_id,
                    src_port,
                    src_addr,
                    data: r.rest(),
                }
            }
            MessageType::UdpClose => Message::UdpClose {
                socket_id: r.u32()?,
                reason: CloseReason::from_u8(r.u8_or_zero()),
                errno: r.u32_or_zero(),
            },
            MessageType::UdpJoinMulticast => Message::UdpJoinMulticast {
                socket_id: r.u32()?,
                group: r.rest_str()?,
            },
            MessageType::UdpLeaveMulticast => Message::UdpLeaveMulticast {
                socket_id: r.u32()?,
                group: r.rest_str()?,
            },
            MessageType::Unknown(message_type) => Message::Unknown {
                message_type,
                payload: r.rest(),
            },
        };
        Ok(message)
    }

    /// Encode the payload only (no header).
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::ClientHello | Message::ServerHello => {}
            Message::Auth { auth_type, token } => {
                buf.put_u8(*auth_type);
                buf.put_slice(token.as_bytes());
                if *auth_type == 0 {
                    buf.put_u8(0);
                }
            }
            Message::AuthResult { ok, message } => {
                buf.put_u8(status(*ok));
                if let Some(message) = message {
                    buf.put_slice(message.as_bytes());
                }
            }
            Message::Error { message } => buf.put_slice(message.as_bytes()),
            Message::TcpConnect {
                socket_id,
                port,
                host,
            } => {
                buf.put_u32_le(*socket_id);
                buf.put_u16_le(*port);
                buf.put_slice(host.as_bytes());
            }
            Message::TcpConnected {
                socket_id,
                ok,
                errno,
            } => {
                buf.put_u32_le(*socket_id);
                buf.put_u8(status(*ok));
                buf.put_u32_le(*errno);
            }
            Message::TcpSend { socket_id, data } | Message::TcpRecv { socket_id, data } => {
                buf.put_u32_le(*socket_id);
                buf.put_slice(data);
            }
            Message::TcpClose {
                socket_id,
                reason,
                errno,
            }
            | Message::UdpClose {
                socket_id,
                reason,
                errno,
            } => {
                buf.put_u32_le(*socket_id);
                buf.put_u8(reason.as_u8());
                buf.put_u32_le(*errno);
            }
            Message::TcpListen {
                server_id,
                port,
                bind_addr,
            } => {
                buf.put_u32_le(*server_id);
                buf.put_u16_le(*port);
                buf.put_slice(bind_addr.as_bytes());
            }
            Message::TcpListenResult {
                server_id,
                ok,
                bound_port,
                errno,
            } => {
                buf.put_u32_le(*server_id);
                buf.put_u8(status(*ok));
                buf.put_u16_le(*bound_port);
                buf.put_u32_le(*errno);
            }
            Message::TcpAccept {
                server_id,
                socket_id,
                remote_port,
                remote_addr,
            } => {
                buf.put_u32_le(*server_id);
                buf.put_u32_le(*socket_id);
                buf.put_u16_le(*remote_port);
                buf.put_slice(remote_addr.as_bytes());
            }
            Message::TcpStopListen { server_id } => buf.put_u32_le(*server_id),
            Message::UdpBind {
                socket_id,
                port,
                bind_addr,
            } => {
                buf.put_u32_le(*socket_id);
                buf.put_u16_le(*port);
                if let Some(addr) = bind_addr {
                    buf.put_slice(addr.as_bytes());
                }
            }
            Message::UdpBound {
                socket_id,
                ok,
                bound_port,
                errno,
            } => {
                buf.put_u32_le(*socket_id);
                buf.put_u8(status(*ok));
                buf.put_u16_le(*bound_port);
                buf.put_u32_le(*errno);
            }
            Message::UdpSend {
                socket_id,
                dest_port: port,
                dest_addr: addr,
                data,
            }
            | Message::UdpRecv {
                socket_id,
                src_port: port,
                src_addr: addr,
                data,
            } => {
                buf.put_u32_le(*socket_id);
                buf.put_u16_le(*port);
                buf.put_u16_le(addr.len() as u16);
                buf.put_slice(addr.as_bytes());
                buf.put_slice(data);
            }
            Message::UdpJoinMulticast { socket_id, group }
            | Message::UdpLeaveMulticast { socket_id, group } => {
                buf.put_u32_le(*socket_id);
                buf.put_slice(group.as_bytes());
            }
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }
        buf.freeze()
    }

    /// Build a complete envelope (header + payload) for this message.
    pub fn to_frame(&self, request_id: u32) -> Frame {
        Frame {
            header: Header::new(self.message_type(), request_id),
            payload: self.encode_payload(),
        }
    }

    /// Shorthand for `to_frame(request_id).encode()`.
    pub fn encode(&self, request_id: u32) -> Bytes {
        self.to_frame(request_id).encode()
    }
}

fn status(ok: bool) -> u8 {
    if ok {
        STATUS_OK
    } else {
        STATUS_FAILED
    }
}

fn utf8(kind: &'static str, bytes: &[u8]) -> BridgeResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| BridgeError::malformed(kind, "text field is not valid UTF-8"))
}

/// Bounds-checked little-endian reader over a payload.
struct PayloadReader {
    kind: &'static str,
    buf: Bytes,
}

impl PayloadReader {
    fn new(kind: &'static str, buf: Bytes) -> Self {
        Self { kind, buf }
    }

    fn need(&self, n: usize) -> BridgeResult<()> {
        if self.buf.remaining() < n {
            return Err(BridgeError::malformed(
                self.kind,
                format!("need {} more bytes, have {}", n, self.buf.remaining()),
            ));
        }
        Ok(())
    }

    fn u8(&mut self) -> BridgeResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> BridgeResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> BridgeResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    // Trailing fields added after the first protocol revision; older
    // peers omit them.
    fn u8_or_zero(&mut self) -> u8 {
        self.u8().unwrap_or(0)
    }

    fn u16_or_zero(&mut self) -> u16 {
        self.u16().unwrap_or(0)
    }

    fn u32_or_zero(&mut self) -> u32 {
        self.u32().unwrap_or(0)
    }

    fn prefixed_str(&mut self) -> BridgeResult<String> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let bytes = self.buf.split_to(len);
        utf8(self.kind, &bytes)
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    fn rest_str(&mut self) -> BridgeResult<String> {
        let rest = self.rest();
        utf8(self.kind, &rest)
    }
}
