//! Control channel message types
//!
//! Requests carry a caller-chosen `id` and an `op` tag with the op's
//! fields beside it:
//!
//! ```json
//! {"id": "7", "op": "readFile", "path": "movie/part1.bin", "offset": 0, "length": 16384}
//! ```
//!
//! Responses echo the id:
//!
//! ```json
//! {"id": "7", "ok": true, "type": "Data", "payload": {"data": "<base64>"}}
//! {"id": "8", "ok": false, "error": "Not found: ..."}
//! ```
//!
//! Events are pushed without a request: `{"event": "MagnetAdded", "payload": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fileops::FileStat;
use crate::types::DownloadRoot;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    Handshake {
        #[serde(default)]
        extension_id: Option<String>,
        #[serde(default)]
        install_id: Option<String>,
    },
    EnsureDir {
        path: String,
    },
    WriteFile {
        path: String,
        #[serde(default)]
        offset: u64,
        /// Base64
        data: String,
    },
    ReadFile {
        path: String,
        #[serde(default)]
        offset: u64,
        #[serde(default)]
        length: Option<u64>,
    },
    StatFile {
        path: String,
    },
    AtomicMove {
        from: String,
        to: String,
        #[serde(default)]
        overwrite: bool,
    },
    HashSha1 {
        /// Base64
        data: String,
    },
    HashFile {
        path: String,
        #[serde(default)]
        offset: u64,
        #[serde(default)]
        length: Option<u64>,
    },
    AddDownloadRoot {
        path: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        removable: bool,
    },
    RemoveDownloadRoot {
        token: String,
    },
    ListDownloadRoots,
    RefreshRoots,
}

/// What the extension needs to reach the data plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub port: u16,
    pub token: String,
    pub version: u32,
    pub roots: Vec<DownloadRoot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ResponsePayload {
    DaemonInfo(DaemonInfo),
    Data { data: String },
    Stat(FileStat),
    Hash { hex: String },
    RootAdded { root: DownloadRoot },
    RootRemoved { token: String },
    Roots { roots: Vec<DownloadRoot> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResponsePayload>,
}

impl Response {
    pub fn ok(id: Value, payload: Option<ResponsePayload>) -> Self {
        Self {
            id,
            ok: true,
            error: None,
            payload,
        }
    }

    pub fn error(id: Value, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            error: Some(error.into()),
            payload: None,
        }
    }
}

/// Unsolicited notification for the extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Event {
    MagnetAdded {
        link: String,
    },
    TorrentAdded {
        name: String,
        infohash: String,
        #[serde(rename = "contentsBase64")]
        contents_base64: String,
    },
}

/// Split a raw request into its id and operation.
///
/// The id is echoed verbatim (`null` when absent) even when the rest of the
/// request is unusable.
pub fn parse_request(bytes: &[u8]) -> (Value, Result<Operation, String>) {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => return (Value::Null, Err(format!("malformed request: {}", e))),
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let op = serde_json::from_value(value).map_err(|e| format!("invalid request: {}", e));
    (id, op)
}
