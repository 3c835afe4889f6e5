//! Control channel
//!
//! The browser launches the host and talks to it over stdin/stdout using
//! the native-messaging framing in [`framing`]. The channel carries the
//! handshake that hands out the data-plane port and token, a small set of
//! file operations, download-root management, and pushed [`Event`]s.

pub mod framing;
pub mod protocol;
mod server;

pub use protocol::{parse_request, DaemonInfo, Event, Operation, Response, ResponsePayload};
pub use server::{dispatch, serve};
