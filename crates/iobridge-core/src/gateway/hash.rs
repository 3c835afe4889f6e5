use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;

use super::files::{resolve_header, u64_header, LENGTH_HEADER, OFFSET_HEADER, PATH_HEADER};
use crate::error::BridgeResult;
use crate::hashing::HashAlgorithm;
use crate::host::HostState;

/// Raw digest of the request body.
pub(crate) async fn hash_bytes(
    Path(algo): Path<String>,
    body: Bytes,
) -> BridgeResult<impl IntoResponse> {
    let algorithm: HashAlgorithm = algo.parse()?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        algorithm.digest(&body),
    ))
}

/// Hex digest of a file range.
pub(crate) async fn hash_file(
    State(state): State<Arc<HostState>>,
    Path((algo, root)): Path<(String, String)>,
    headers: HeaderMap,
) -> BridgeResult<String> {
    let algorithm: HashAlgorithm = algo.parse()?;
    let path = resolve_header(&state, &root, &headers, PATH_HEADER)?;
    let offset = u64_header(&headers, OFFSET_HEADER)?.unwrap_or(0);
    let length = u64_header(&headers, LENGTH_HEADER)?;
    algorithm.digest_file(&path, offset, length).await
}
