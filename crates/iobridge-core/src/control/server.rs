use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::framing::{read_message, write_message};
use super::protocol::{parse_request, Event, Operation, Response, ResponsePayload};
use crate::error::{BridgeError, BridgeResult};
use crate::fileops;
use crate::hashing::{self, HashAlgorithm};
use crate::host::HostState;

/// Largest `readFile` result. Base64 grows it by a third, which keeps the
/// response under the browser's 1 MB limit on host-to-extension messages.
pub const MAX_READ_LENGTH: u64 = 512 * 1024;

/// Run the control channel until `input` ends.
///
/// Returns `Ok(())` on a clean end of input and an error when the input
/// breaks mid-message or the output can no longer be written. Either way
/// the caller should shut the process down.
pub async fn serve<R, W>(
    state: Arc<HostState>,
    input: R,
    mut output: W,
    mut events: mpsc::Receiver<Event>,
) -> BridgeResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    // Reads happen on their own task so a half-read message is never
    // dropped by the select below.
    let (frames_tx, mut frames) = mpsc::channel::<BridgeResult<Vec<u8>>>(16);
    let reader = tokio::spawn(async move {
        let mut input = input;
        loop {
            match read_message(&mut input).await {
                Ok(Some(body)) => {
                    if frames_tx.send(Ok(body)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = frames_tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            frame = frames.recv() => {
                let body = match frame {
                    Some(Ok(body)) => body,
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                };
                let response = handle(&state, &body).await;
                if let Err(e) = send(&mut output, &response).await {
                    break Err(e);
                }
            }
            Some(event) = events.recv() => {
                debug!(?event, "Pushing event");
                if let Err(e) = send(&mut output, &event).await {
                    break Err(e);
                }
            }
        }
    };

    reader.abort();
    result
}

async fn send<W, T>(output: &mut W, message: &T) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(message)?;
    write_message(output, &body).await
}

async fn handle(state: &HostState, body: &[u8]) -> Response {
    let (id, op) = parse_request(body);
    let op = match op {
        Ok(op) => op,
        Err(reason) => {
            warn!(%reason, "Rejected control request");
            return Response::error(id, reason);
        }
    };

    match dispatch(state, op).await {
        Ok(payload) => Response::ok(id, payload),
        Err(e) => {
            debug!(error = %e, "Control op failed");
            Response::error(id, e.to_string())
        }
    }
}

/// Execute one control operation against the host state.
pub async fn dispatch(state: &HostState, op: Operation) -> BridgeResult<Option<ResponsePayload>> {
    match op {
        Operation::Handshake {
            extension_id,
            install_id,
        } => {
            info!(?extension_id, has_install_id = install_id.is_some(), "Handshake");
            let info = state.handshake(install_id, extension_id).await?;
            Ok(Some(ResponsePayload::DaemonInfo(info)))
        }
        Operation::EnsureDir { path } => {
            fileops::ensure_dir(&state.resolve_default(&path)?).await?;
            Ok(None)
        }
        Operation::WriteFile { path, offset, data } => {
            let data = decode_base64(&data)?;
            let target = state.resolve_default(&path)?;
            fileops::write_at(&target, offset, &data, None).await?;
            Ok(None)
        }
        Operation::ReadFile {
            path,
            offset,
            length,
        } => {
            let target = state.resolve_default(&path)?;
            let data = fileops::read_range(&target, offset, length, MAX_READ_LENGTH).await?;
            Ok(Some(ResponsePayload::Data {
                data: STANDARD.encode(data),
            }))
        }
        Operation::StatFile { path } => {
            let stat = fileops::stat(&state.resolve_default(&path)?).await?;
            Ok(Some(ResponsePayload::Stat(stat)))
        }
        Operation::AtomicMove {
            from,
            to,
            overwrite,
        } => {
            let from = state.resolve_default(&from)?;
            let to = state.resolve_default(&to)?;
            fileops::atomic_move(&from, &to, overwrite).await?;
            Ok(None)
        }
        Operation::HashSha1 { data } => {
            let digest = hashing::sha1(&decode_base64(&data)?);
            Ok(Some(ResponsePayload::Hash {
                hex: hex::encode(digest),
            }))
        }
        Operation::HashFile {
            path,
            offset,
            length,
        } => {
            let target = state.resolve_default(&path)?;
            let hex = HashAlgorithm::Sha1.digest_file(&target, offset, length).await?;
            Ok(Some(ResponsePayload::Hash { hex }))
        }
        Operation::AddDownloadRoot {
            path,
            display_name,
            removable,
        } => {
            let root = state
                .add_root(Path::new(&path), display_name, removable)
                .await?;
            Ok(Some(ResponsePayload::RootAdded { root }))
        }
        Operation::RemoveDownloadRoot { token } => {
            state.remove_root(&token).await?;
            Ok(Some(ResponsePayload::RootRemoved { token }))
        }
        Operation::ListDownloadRoots => Ok(Some(ResponsePayload::Roots {
            roots: state.roots(),
        })),
        Operation::RefreshRoots => {
            let roots = state.refresh_roots().await?;
            Ok(Some(ResponsePayload::Roots { roots }))
        }
    }
}

fn decode_base64(data: &str) -> BridgeResult<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| BridgeError::Validation(format!("invalid base64 data: {}", e)))
}
