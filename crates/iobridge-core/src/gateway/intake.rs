//! Endpoints for the helper process and host introspection.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::control::Event;
use crate::error::{BridgeError, BridgeResult};
use crate::host::HostState;
use crate::relay::StatsSnapshot;

/// Largest base64 torrent forwarded; the browser drops native messages
/// above roughly 1 MB.
pub const MAX_TORRENT_BASE64: usize = 900_000;

#[derive(Debug, Deserialize)]
pub(crate) struct AddMagnet {
    magnet: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddTorrent {
    file_name: String,
    contents_base64: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct Queued {
    status: &'static str,
    message: String,
}

pub(crate) async fn add_magnet(
    State(state): State<Arc<HostState>>,
    Json(request): Json<AddMagnet>,
) -> BridgeResult<Json<Queued>> {
    let link = request.magnet.trim().to_string();
    if !link.starts_with("magnet:") {
        return Err(BridgeError::Validation("not a magnet link".into()));
    }
    state.emit(Event::MagnetAdded { link }).await?;
    info!("Queued magnet link for the extension");
    Ok(Json(Queued {
        status: "queued",
        message: "magnet link forwarded".into(),
    }))
}

pub(crate) async fn add_torrent(
    State(state): State<Arc<HostState>>,
    Json(request): Json<AddTorrent>,
) -> BridgeResult<Json<Queued>> {
    if request.contents_base64.len() > MAX_TORRENT_BASE64 {
        return Err(BridgeError::TooLarge(format!(
            "torrent of {} base64 bytes exceeds {}",
            request.contents_base64.len(),
            MAX_TORRENT_BASE64
        )));
    }
    STANDARD
        .decode(&request.contents_base64)
        .map_err(|e| BridgeError::Validation(format!("invalid torrent contents: {}", e)))?;

    let message = format!("{} forwarded", request.file_name);
    state
        .emit(Event::TorrentAdded {
            name: request.file_name,
            infohash: String::new(),
            contents_base64: request.contents_base64,
        })
        .await?;
    info!("Queued torrent file for the extension");
    Ok(Json(Queued {
        status: "queued",
        message,
    }))
}

pub(crate) async fn reload_roots(State(state): State<Arc<HostState>>) -> BridgeResult<Json<Value>> {
    let count = state.reload_roots_from_disk().await?;
    Ok(Json(json!({ "status": "ok", "roots": count })))
}

#[derive(Debug, Serialize)]
pub(crate) struct HostStats {
    pid: u32,
    port: u16,
    uptime_secs: u64,
    #[serde(flatten)]
    relay: StatsSnapshot,
}

pub(crate) async fn stats(State(state): State<Arc<HostState>>) -> Json<HostStats> {
    Json(HostStats {
        pid: state.pid(),
        port: state.port(),
        uptime_secs: state.uptime_secs(),
        relay: state.stats(),
    })
}
