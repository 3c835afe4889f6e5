//! Download-root path resolution
//!
//! Every filesystem path the extension names is relative to a download
//! root. Resolution happens entirely before any file is touched:
//!
//! 1. decode the `X-Path-Base64` value to UTF-8 text
//! 2. normalize lexically (`.` dropped, `..` pops, climbing past the root
//!    is rejected)
//! 3. walk the longest prefix that already exists, canonicalizing each
//!    step so symlinks are resolved, and require every step to stay under
//!    the canonical root
//! 4. re-append the components that do not exist yet
//!
//! The result is always strictly inside the canonical root.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use base64::Engine;

use crate::error::{BridgeError, BridgeResult};

/// Decode a base64 path header into text.
pub fn decode_path_header(value: &str) -> BridgeResult<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|_| BridgeError::Validation("path is not valid base64".into()))?;
    String::from_utf8(bytes).map_err(|_| BridgeError::Validation("path is not valid UTF-8".into()))
}

/// Resolve `relative` under `root`, rejecting anything that would land
/// outside of it.
pub fn resolve(root: &Path, relative: &str) -> BridgeResult<PathBuf> {
    let canonical_root = root.canonicalize().map_err(|e| {
        BridgeError::NotFound(format!("download root {} unavailable: {}", root.display(), e))
    })?;

    let parts = normalize(relative)?;

    let mut resolved = canonical_root.clone();
    let mut existing = 0;
    for part in &parts {
        let candidate = resolved.join(part);
        match std::fs::symlink_metadata(&candidate) {
            Ok(_) => {
                let canonical = candidate.canonicalize().map_err(|_| {
                    BridgeError::Validation(format!("cannot resolve {}", relative))
                })?;
                if !canonical.starts_with(&canonical_root) {
                    return Err(BridgeError::Validation(format!(
                        "path escapes download root: {}",
                        relative
                    )));
                }
                resolved = canonical;
                existing += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    for part in &parts[existing..] {
        resolved.push(part);
    }

    if resolved == canonical_root || !resolved.starts_with(&canonical_root) {
        return Err(BridgeError::Validation(format!(
            "path must name an entry inside the download root: {}",
            relative
        )));
    }
    Ok(resolved)
}

fn normalize(relative: &str) -> BridgeResult<Vec<OsString>> {
    let trimmed = relative.trim_start_matches('/');
    let mut parts: Vec<OsString> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(BridgeError::Validation(format!(
                        "path escapes download root: {}",
                        relative
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BridgeError::Validation(format!(
                    "absolute paths are not allowed: {}",
                    relative
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(BridgeError::Validation("empty path".into()));
    }
    Ok(parts)
}
