//! iobridge core library
//!
//! Native host that gives a sandboxed browser extension raw TCP/UDP sockets
//! and file access inside user-approved download directories.
//!
//! ## Overview
//!
//! The browser launches the host over native messaging. The host binds a
//! loopback HTTP server (the data plane), writes its port and a random
//! session token into a shared discovery file, and answers the extension's
//! handshake on stdin/stdout with the same details. From then on:
//!
//! - **Socket relay**: one WebSocket at `/io` multiplexes every TCP/UDP
//!   socket the extension opens, using the binary envelope in [`envelope`].
//! - **File gateway**: token-authenticated HTTP calls read, write, hash and
//!   move files inside download roots, with traversal protection.
//! - **Control channel**: handshake, root management and pushed events.
//!
//! ## Quick Start
//!
//! ```ignore
//! use iobridge_core::{attribution, Host, HostConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HostConfig::default();
//!     let browser = attribution::attribute_current_process(None).into_browser();
//!     let host = Host::bind(config, browser).await?;
//!     host.run(tokio::io::stdin(), tokio::io::stdout()).await?;
//!     Ok(())
//! }
//! ```

pub mod attribution;
pub mod auth;
pub mod config;
pub mod control;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod fileops;
pub mod gateway;
pub mod hashing;
pub mod host;
pub mod logging;
pub mod paths;
pub mod relay;
pub mod types;

// Re-exports
pub use attribution::Attribution;
pub use auth::SessionToken;
pub use config::{HostConfig, RelayConfig};
pub use discovery::DiscoveryStore;
pub use envelope::{Frame, Header, Message, MessageType, PROTOCOL_VERSION};
pub use error::{BridgeError, BridgeResult};
pub use host::{Host, HostState};
pub use relay::{RelaySession, RelayStats, StatsSnapshot};
pub use types::*;
