//! Session authentication for the data plane
//!
//! A single [`SessionToken`] is minted at process start and is the only
//! credential for the file gateway and the socket relay. It is handed to
//! the extension through the discovery descriptor and the control-channel
//! handshake, never over the network.

use std::fmt;

use axum::http::{header, HeaderMap};
use base64::Engine;
use rand::RngCore;

use crate::error::{BridgeError, BridgeResult};

/// Custom header carrying the bare token
pub const AUTH_HEADER: &str = "x-auth-token";

/// Number of random bytes behind a session token
pub const TOKEN_BYTES: usize = 32;

/// Random bytes encoded as URL-safe base64 without padding.
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// The per-process data-plane credential.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        Self(random_token(TOKEN_BYTES))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare a presented token without short-circuiting on the first
    /// differing byte.
    pub fn matches(&self, presented: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), presented.as_bytes())
    }

    /// Check the request headers for this token.
    ///
    /// Either `X-Auth-Token: <token>` or `Authorization: Bearer <token>` is
    /// accepted.
    pub fn authorize(&self, headers: &HeaderMap) -> BridgeResult<()> {
        let presented = presented_token(headers)
            .ok_or_else(|| BridgeError::Authentication("missing token".into()))?;
        if self.matches(presented) {
            Ok(())
        } else {
            Err(BridgeError::Authentication("invalid token".into()))
        }
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// Keep the secret out of logs
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(AUTH_HEADER) {
        return value.to_str().ok();
    }
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
