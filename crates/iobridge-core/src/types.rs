//! Core data types for the iobridge host
//!
//! These are the records persisted in the discovery descriptor and
//! returned to the extension during the handshake.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current discovery descriptor format version
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// The on-disk discovery file: every known host instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDescriptor {
    pub version: u32,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl Default for DiscoveryDescriptor {
    fn default() -> Self {
        Self {
            version: DESCRIPTOR_VERSION,
            profiles: Vec::new(),
        }
    }
}

impl DiscoveryDescriptor {
    pub fn find(&self, pid: u32) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.pid == pid)
    }

    pub fn find_mut(&mut self, pid: u32) -> Option<&mut Profile> {
        self.profiles.iter_mut().find(|p| p.pid == pid)
    }
}

/// Which browser launched a host instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserInfo {
    pub name: String,
    pub binary: String,
    #[serde(default)]
    pub extension_id: Option<String>,
}

/// One running host instance as seen by the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable per-extension-install id, attached on the first handshake
    #[serde(default)]
    pub install_id: Option<String>,
    #[serde(default)]
    pub extension_id: Option<String>,
    pub salt: String,
    pub pid: u32,
    pub port: u16,
    pub token: String,
    pub started: u64,
    pub last_used: u64,
    pub browser: BrowserInfo,
    #[serde(default)]
    pub download_roots: Vec<DownloadRoot>,
}

impl Profile {
    pub fn root(&self, token: &str) -> Option<&DownloadRoot> {
        self.download_roots.iter().find(|r| r.token == token)
    }
}

/// A directory the extension has been granted access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRoot {
    /// Opaque key the extension uses to name this root
    pub token: String,
    pub path: PathBuf,
    pub display_name: String,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub last_stat_ok: bool,
    #[serde(default)]
    pub last_checked: u64,
}

impl DownloadRoot {
    /// Create a root with a fresh random token.
    pub fn new(path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            token: crate::auth::random_token(16),
            path: path.into(),
            display_name: display_name.into(),
            removable: false,
            last_stat_ok: false,
            last_checked: 0,
        }
    }

    /// Stat the root directory and record the outcome.
    pub fn refresh_health(&mut self) {
        self.last_stat_ok = std::fs::metadata(&self.path)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        self.last_checked = unix_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_tolerates_missing_fields() {
        let json = r#"{
            "version": 1,
            "profiles": [{
                "salt": "s", "pid": 42, "port": 8080, "token": "t",
                "started": 1, "last_used": 2,
                "browser": {"name": "Chrome", "binary": "/usr/bin/chrome"}
            }]
        }"#;
        let desc: DiscoveryDescriptor = serde_json::from_str(json).unwrap();
        let profile = desc.find(42).unwrap();
        assert_eq!(profile.install_id, None);
        assert!(profile.download_roots.is_empty());
        assert_eq!(profile.browser.extension_id, None);
    }

    #[test]
    fn test_refresh_health_marks_missing_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut root = DownloadRoot::new(temp.path(), "Downloads");
        root.refresh_health();
        assert!(root.last_stat_ok);
        assert!(root.last_checked > 0);

        root.path = temp.path().join("gone");
        root.refresh_health();
        assert!(!root.last_stat_ok);
    }

    #[test]
    fn test_roots_get_distinct_tokens() {
        let a = DownloadRoot::new("/a", "a");
        let b = DownloadRoot::new("/a", "a");
        assert_ne!(a.token, b.token);
    }
}
