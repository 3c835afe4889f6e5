//! Control channel over an in-memory pipe, framed as the browser frames it.

use std::time::Duration;

use iobridge_core::control::{self, framing, Event};
use iobridge_core::{BrowserInfo, HostConfig, HostState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    temp: TempDir,
    state: std::sync::Arc<HostState>,
    to_host: DuplexStream,
    from_host: DuplexStream,
    server: JoinHandle<iobridge_core::BridgeResult<()>>,
}

impl Harness {
    async fn start() -> Self {
        let temp = TempDir::new().unwrap();
        let downloads = temp.path().join("Downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        let config = HostConfig {
            config_dir: temp.path().join("config"),
            download_root: Some(downloads),
            ..HostConfig::default()
        };
        let (state, events) = HostState::new(&config, 5555, BrowserInfo::default());
        state.register().await.unwrap();

        let (to_host, host_in) = duplex(64 * 1024);
        let (host_out, from_host) = duplex(64 * 1024);
        let server = tokio::spawn(control::serve(state.clone(), host_in, host_out, events));
        Self {
            temp,
            state,
            to_host,
            from_host,
            server,
        }
    }

    async fn send(&mut self, request: Value) {
        framing::write_message(&mut self.to_host, request.to_string().as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Value {
        let body = timeout(WAIT, framing::read_message(&mut self.from_host))
            .await
            .expect("timed out waiting for the host")
            .unwrap()
            .expect("host closed the channel");
        serde_json::from_slice(&body).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send(request).await;
        self.recv().await
    }
}

#[tokio::test]
async fn test_handshake_returns_daemon_info() {
    let mut h = Harness::start().await;
    let response = h
        .call(json!({"id": "h1", "op": "handshake", "extensionId": "ext-1", "installId": "inst-1"}))
        .await;

    assert_eq!(response["id"], "h1");
    assert_eq!(response["ok"], true);
    assert_eq!(response["type"], "DaemonInfo");
    assert_eq!(response["payload"]["port"], 5555);
    assert_eq!(response["payload"]["token"], h.state.token().as_str());
    assert_eq!(response["payload"]["version"], 1);
    assert_eq!(response["payload"]["roots"].as_array().unwrap().len(), 1);

    let desc = h.state.store().read();
    assert_eq!(desc.profiles.len(), 1);
    assert_eq!(desc.profiles[0].install_id.as_deref(), Some("inst-1"));
}

#[tokio::test]
async fn test_file_ops_round_trip() {
    let mut h = Harness::start().await;

    let response = h.call(json!({"id": 1, "op": "ensureDir", "path": "show"})).await;
    assert_eq!(response, json!({"id": 1, "ok": true}));

    let response = h
        .call(json!({"id": 2, "op": "writeFile", "path": "show/e1.part", "data": "aGVsbG8="}))
        .await;
    assert_eq!(response["ok"], true);

    let response = h
        .call(json!({"id": 3, "op": "atomicMove", "from": "show/e1.part", "to": "show/e1.mkv"}))
        .await;
    assert_eq!(response["ok"], true);

    let response = h.call(json!({"id": 4, "op": "statFile", "path": "show/e1.mkv"})).await;
    assert_eq!(response["type"], "Stat");
    assert_eq!(response["payload"]["size"], 5);
    assert_eq!(response["payload"]["isDir"], false);

    let response = h.call(json!({"id": 5, "op": "readFile", "path": "show/e1.mkv"})).await;
    assert_eq!(response["payload"]["data"], "aGVsbG8=");

    let response = h.call(json!({"id": 6, "op": "hashFile", "path": "show/e1.mkv"})).await;
    assert_eq!(
        response["payload"]["hex"],
        "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
    );

    let response = h.call(json!({"id": 7, "op": "readFile", "path": "show/missing"})).await;
    assert_eq!(response["ok"], false);
    assert!(response["error"].as_str().unwrap().contains("Not found"));
}

#[tokio::test]
async fn test_root_management() {
    let mut h = Harness::start().await;
    let extra = h.temp.path().join("Media");
    std::fs::create_dir_all(&extra).unwrap();

    let response = h
        .call(json!({
            "id": "a",
            "op": "addDownloadRoot",
            "path": extra.to_string_lossy(),
            "displayName": "Media",
            "removable": true
        }))
        .await;
    assert_eq!(response["type"], "RootAdded");
    let token = response["payload"]["root"]["token"].as_str().unwrap().to_string();

    let response = h.call(json!({"id": "b", "op": "listDownloadRoots"})).await;
    assert_eq!(response["payload"]["roots"].as_array().unwrap().len(), 2);

    let response = h.call(json!({"id": "c", "op": "removeDownloadRoot", "token": token})).await;
    assert_eq!(response["type"], "RootRemoved");

    let response = h.call(json!({"id": "d", "op": "refreshRoots"})).await;
    let roots = response["payload"]["roots"].as_array().unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0]["last_stat_ok"], true);
}

#[tokio::test]
async fn test_bad_requests_are_not_fatal() {
    let mut h = Harness::start().await;

    framing::write_message(&mut h.to_host, b"{not json").await.unwrap();
    let response = h.recv().await;
    assert_eq!(response["id"], Value::Null);
    assert_eq!(response["ok"], false);

    let response = h.call(json!({"id": 9, "op": "launchRockets"})).await;
    assert_eq!(response["id"], 9);
    assert_eq!(response["ok"], false);

    let response = h.call(json!({"id": 10, "op": "writeFile", "path": "../x", "data": ""})).await;
    assert_eq!(response["ok"], false);

    // Still serving
    let response = h.call(json!({"id": 11, "op": "hashSha1", "data": ""})).await;
    assert_eq!(response["payload"]["hex"], "da39a3ee5e6b4b0d3255bfef95601890afd80709");
}

#[tokio::test]
async fn test_events_are_pushed() {
    let mut h = Harness::start().await;
    h.state
        .emit(Event::MagnetAdded {
            link: "magnet:?xt=urn:btih:abc".into(),
        })
        .await
        .unwrap();

    let event = h.recv().await;
    assert_eq!(
        event,
        json!({"event": "MagnetAdded", "payload": {"link": "magnet:?xt=urn:btih:abc"}})
    );
}

#[tokio::test]
async fn test_end_of_input_stops_serving() {
    let h = Harness::start().await;
    drop(h.to_host);
    let result = timeout(WAIT, h.server).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_truncated_message_is_an_error() {
    let mut h = Harness::start().await;
    use tokio::io::AsyncWriteExt;
    h.to_host.write_all(&[10, 0, 0, 0, b'{']).await.unwrap();
    drop(h.to_host);
    let result = timeout(WAIT, h.server).await.unwrap().unwrap();
    assert!(result.is_err());
}
