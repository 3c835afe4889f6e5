//! Host configuration
//!
//! The binary fills [`HostConfig`] from command-line flags and `IOBRIDGE_*`
//! environment variables; tests build it directly.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Limits applied to every relay connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a TCP_CONNECT may take before it resolves as failed
    pub connect_timeout: Duration,
    /// Bytes that may sit in one socket's write queue
    pub max_pending_write: usize,
    /// Read buffer for TCP sockets
    pub tcp_read_chunk: usize,
    /// Read buffer for UDP sockets (one datagram)
    pub udp_read_chunk: usize,
    /// Frames buffered towards the WebSocket before socket readers wait
    pub outbound_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_pending_write: 4 * 1024 * 1024,
            tcp_read_chunk: 64 * 1024,
            udp_read_chunk: 65_535,
            outbound_queue: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory holding `iobridge/rpc-info.json`
    pub config_dir: PathBuf,
    /// Address the data-plane server binds to
    pub bind: IpAddr,
    /// 0 lets the OS pick
    pub port: u16,
    /// Directory registered as the default download root
    pub download_root: Option<PathBuf>,
    /// Extension id extracted from the launcher arguments
    pub extension_id: Option<String>,
    /// Extra origins allowed by CORS besides browser extension schemes
    pub allowed_origins: Vec<String>,
    pub relay: RelayConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            download_root: dirs::download_dir(),
            extension_id: None,
            allowed_origins: Vec::new(),
            relay: RelayConfig::default(),
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Pull the extension id out of the arguments a browser passes to a
/// native messaging host.
///
/// Chromium browsers pass the caller origin (`chrome-extension://<id>/`);
/// Firefox passes the manifest path followed by the extension id.
pub fn extension_id_from_launcher_args(args: &[String]) -> Option<String> {
    for arg in args {
        if let Some(rest) = arg.strip_prefix("chrome-extension://") {
            let id = rest.trim_end_matches('/');
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    match args {
        [manifest, id, ..] if manifest.ends_with(".json") && !id.starts_with('-') => {
            Some(id.clone())
        }
        _ => None,
    }
}
