//! File gateway handlers
//!
//! The root token travels in the URL; the path inside the root travels
//! base64-encoded in a header so any byte sequence (`#`, `?`, non-ASCII)
//! survives unchanged.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use crate::error::{BridgeError, BridgeResult};
use crate::fileops::{self, FileStat};
use crate::host::HostState;
use crate::paths::decode_path_header;

use super::MAX_BODY_SIZE;

pub(crate) const PATH_HEADER: &str = "x-path-base64";
pub(crate) const DEST_PATH_HEADER: &str = "x-dest-path-base64";
pub(crate) const OFFSET_HEADER: &str = "x-offset";
pub(crate) const LENGTH_HEADER: &str = "x-length";
pub(crate) const EXPECTED_SHA1_HEADER: &str = "x-expected-sha1";
pub(crate) const OVERWRITE_HEADER: &str = "x-overwrite";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> BridgeResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| BridgeError::Validation(format!("{} is not valid text", name)))
        })
        .transpose()
}

pub(crate) fn u64_header(headers: &HeaderMap, name: &str) -> BridgeResult<Option<u64>> {
    header_str(headers, name)?
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| BridgeError::Validation(format!("{} must be an integer", name)))
        })
        .transpose()
}

fn bool_header(headers: &HeaderMap, name: &str) -> BridgeResult<bool> {
    Ok(matches!(
        header_str(headers, name)?.map(|v| v.trim().to_ascii_lowercase()),
        Some(v) if v == "true" || v == "1"
    ))
}

/// Resolve the path named by `name` inside the root `token`.
pub(crate) fn resolve_header(
    state: &HostState,
    token: &str,
    headers: &HeaderMap,
    name: &str,
) -> BridgeResult<PathBuf> {
    let encoded = header_str(headers, name)?
        .ok_or_else(|| BridgeError::Validation(format!("missing {} header", name)))?;
    let relative = decode_path_header(encoded)?;
    state.resolve(token, &relative)
}

fn expected_sha1(headers: &HeaderMap) -> BridgeResult<Option<Vec<u8>>> {
    let Some(value) = header_str(headers, EXPECTED_SHA1_HEADER)? else {
        return Ok(None);
    };
    let digest = hex::decode(value.trim())
        .map_err(|_| BridgeError::Validation("expected hash is not hex".into()))?;
    if digest.len() != 20 {
        return Err(BridgeError::Validation(format!(
            "expected hash has {} bytes, SHA-1 has 20",
            digest.len()
        )));
    }
    Ok(Some(digest))
}

pub(crate) async fn write(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> BridgeResult<StatusCode> {
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    let offset = u64_header(&headers, OFFSET_HEADER)?.unwrap_or(0);
    let expected = expected_sha1(&headers)?;

    fileops::write_at(&path, offset, &body, expected.as_deref()).await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn read(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> BridgeResult<impl IntoResponse> {
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    let offset = u64_header(&headers, OFFSET_HEADER)?.unwrap_or(0);
    let length = u64_header(&headers, LENGTH_HEADER)?;

    let data = fileops::read_range(&path, offset, length, MAX_BODY_SIZE as u64).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

pub(crate) async fn ensure_dir(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> BridgeResult<StatusCode> {
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    fileops::ensure_dir(&path).await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn stat(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> BridgeResult<Json<FileStat>> {
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    Ok(Json(fileops::stat(&path).await?))
}

pub(crate) async fn move_file(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> BridgeResult<StatusCode> {
    let from = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    let to = resolve_header(&state, &root, &headers, DEST_PATH_HEADER)?;
    let overwrite = bool_header(&headers, OVERWRITE_HEADER)?;

    fileops::atomic_move(&from, &to, overwrite).await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn list(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> BridgeResult<Json<Vec<String>>> {
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    Ok(Json(fileops::list_dir(&path).await?))
}

pub(crate) async fn delete(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> BridgeResult<StatusCode> {
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    fileops::delete(&path).await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn truncate(
    State(state): State<Arc<HostState>>,
    Path(root): Path<String>,
    headers: HeaderMap,
) -> BridgeResult<StatusCode> {
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    let length = u64_header(&headers, LENGTH_HEADER)?
        .ok_or_else(|| BridgeError::Validation(format!("missing {} header", LENGTH_HEADER)))?;
    fileops::truncate(&path, length).await?;
    Ok(StatusCode::OK)
}
