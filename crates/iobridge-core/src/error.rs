//! Error types for the iobridge host

use thiserror::Error;

/// Main error type for host operations.
///
/// Every variant maps onto one failure class visible to the extension:
/// HTTP status codes on the file gateway, `{ok: false}` responses on the
/// control channel, and ERROR frames on the socket relay.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Missing or wrong session token, or a relay op before AUTH succeeded
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Bad encoding, malformed path, traversal attempt, bad parameters
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Download root token not known to this process
    #[error("Unknown download root: {0}")]
    UnknownRoot(String),

    /// Socket id, file or profile entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Hash mismatch, socket id already in use, move destination exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request body over the accepted size
    #[error("Payload too large: {0}")]
    TooLarge(String),

    /// Per-socket write queue is full
    #[error("Back-pressure limit exceeded: {0}")]
    Backpressure(String),

    /// Connect or other bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Version mismatch or message illegal in the current state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Fewer than 8 bytes where an envelope header was expected
    #[error("Malformed envelope: {0} bytes is shorter than the header")]
    MalformedEnvelope(usize),

    /// Payload too short or otherwise unreadable for its message type
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    /// Discovery descriptor could not be locked, read or written
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::MalformedPayload {
            kind,
            reason: reason.into(),
        }
    }

    /// OS error number carried by an I/O failure, 0 when there is none.
    pub fn errno(&self) -> u32 {
        match self {
            BridgeError::Io(e) => e.raw_os_error().map(|c| c as u32).unwrap_or(0),
            _ => 0,
        }
    }
}

/// Result type alias using BridgeError
pub type BridgeResult<T> = Result<T, BridgeError>;
