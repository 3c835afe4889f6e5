//! Data-plane HTTP server
//!
//! Loopback-only axum router carrying the file gateway, hashing, intake
//! endpoints for the helper process, and the WebSocket socket relay at
//! `/io`. Every route except `/health` and `/io` requires the session
//! token; `/io` authenticates inside the relay protocol instead.

mod files;
mod hash;
mod intake;
mod ws;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{request::Parts, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::BridgeError;
use crate::host::HostState;

/// Largest request body accepted
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Build the data-plane router over shared host state.
pub fn router(state: Arc<HostState>) -> Router {
    let protected = Router::new()
        .route("/hash/:algo", post(hash::hash_bytes))
        .route("/hash/:algo/:root", get(hash::hash_file))
        .route("/write/:root", post(files::write))
        .route("/read/:root", get(files::read))
        .route("/ops/ensure-dir/:root", post(files::ensure_dir))
        .route("/ops/stat/:root", get(files::stat))
        .route("/ops/move/:root", post(files::move_file))
        .route("/ops/list/:root", get(files::list))
        .route("/ops/delete/:root", post(files::delete))
        .route("/ops/truncate/:root", post(files::truncate))
        .route("/add-magnet", post(intake::add_magnet))
        .route("/add-torrent", post(intake::add_torrent))
        .route("/api/read-rpc-info-from-disk", post(intake::reload_roots))
        .route("/stats", get(intake::stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/io", get(ws::upgrade))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(
    State(state): State<Arc<HostState>>,
    request: Request,
    next: Next,
) -> Response {
    match state.token().authorize(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(path = %request.uri().path(), "Rejected unauthenticated request");
            e.into_response()
        }
    }
}

fn cors(state: &HostState) -> CorsLayer {
    let extra = state.allowed_origins().to_vec();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                let Ok(origin) = origin.to_str() else {
                    return false;
                };
                origin.starts_with("chrome-extension://")
                    || origin.starts_with("moz-extension://")
                    || extra.iter().any(|allowed| allowed == origin)
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::Authentication(_) => StatusCode::UNAUTHORIZED,
            BridgeError::Validation(_)
            | BridgeError::Protocol(_)
            | BridgeError::MalformedEnvelope(_)
            | BridgeError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
            BridgeError::UnknownRoot(_) => StatusCode::FORBIDDEN,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::Conflict(_) => StatusCode::CONFLICT,
            BridgeError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            BridgeError::Backpressure(_) => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Discovery(_) | BridgeError::Serialization(_) | BridgeError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}
