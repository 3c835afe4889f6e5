//! WebSocket transport for the socket relay.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::host::HostState;
use crate::relay::RelaySession;

/// How long queued frames may take to flush after the session ends
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<HostState>>) -> Response {
    ws.on_upgrade(move |socket| relay_connection(socket, state))
}

async fn relay_connection(socket: WebSocket, state: Arc<HostState>) {
    let (mut sink, mut stream) = socket.split();
    let queue = state.relay_config().outbound_queue;
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(queue);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(queue);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Binary(frame.to_vec())).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    let session = RelaySession::new(
        state.token().clone(),
        state.relay_config().clone(),
        state.relay_stats().clone(),
        outbound_tx,
    );
    let mut session_task = tokio::spawn(session.run(inbound_rx));

    loop {
        tokio::select! {
            _ = &mut session_task => break,
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if inbound_tx.send(Bytes::from(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => debug!("Ignoring text frame on relay connection"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Relay WebSocket failed");
                    break;
                }
            },
        }
    }

    // Ending the inbound side stops the session, which drops its sockets
    // and the last outbound sender.
    drop(inbound_tx);
    if !session_task.is_finished() {
        let _ = session_task.await;
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}
