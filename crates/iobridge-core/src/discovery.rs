//! Discovery descriptor persistence
//!
//! The extension finds running host instances by reading a single JSON
//! file (`rpc-info.json`) shared by every host process on the machine.
//!
//! ## Concurrency
//!
//! ```text
//!   host A (pid 100) ─┐                      ┌─> rpc-info.json.lock  (flock)
//!   host B (pid 200) ─┼─> lock ─> read ─> mutate ─> write tmp ─> rename
//!   host C (pid 300) ─┘                      └─> rpc-info.json     (atomic)
//! ```
//!
//! Every mutation is a read-modify-write performed while holding an
//! exclusive advisory lock on a sibling lock file, and the new contents are
//! written to a temp file in the same directory and renamed over the
//! descriptor. Readers never take the lock: they always observe either the
//! old or the new file, never a torn write.
//!
//! Entries are keyed by pid while a process runs. The extension's install
//! id is attached on the first handshake; a dormant entry left by an
//! earlier run of the same install donates its download roots and is
//! removed, so roots survive host restarts.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::types::{unix_now, DiscoveryDescriptor, DownloadRoot, Profile};

/// Directory under the OS config dir that holds the descriptor
pub const APP_DIR_NAME: &str = "iobridge";

/// Descriptor file name
pub const DESCRIPTOR_FILE: &str = "rpc-info.json";

/// Result of [`DiscoveryStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written,
    NotFound,
}

/// Handle on the discovery descriptor file.
#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl DiscoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
        }
    }

    /// Store at `<config_dir>/iobridge/rpc-info.json`.
    pub fn in_config_dir(config_dir: impl AsRef<Path>) -> Self {
        Self::new(config_dir.as_ref().join(APP_DIR_NAME).join(DESCRIPTOR_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the descriptor. A missing or unparsable file reads as empty.
    pub fn read(&self) -> DiscoveryDescriptor {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return DiscoveryDescriptor::default(),
        };
        match serde_json::from_str(&content) {
            Ok(desc) => desc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unparsable discovery descriptor");
                DiscoveryDescriptor::default()
            }
        }
    }

    /// Insert this process's profile, replacing any stale entry that
    /// carries the same pid.
    pub fn register(&self, profile: Profile) -> BridgeResult<()> {
        let pid = profile.pid;
        self.mutate(|desc| {
            desc.profiles.retain(|p| p.pid != pid);
            desc.profiles.push(profile);
        })?;
        info!(pid, path = %self.path.display(), "Registered profile");
        Ok(())
    }

    /// Apply `mutator` to the entry with this pid only.
    pub fn update<F>(&self, pid: u32, mutator: F) -> BridgeResult<UpdateOutcome>
    where
        F: FnOnce(&mut Profile),
    {
        self.mutate(|desc| match desc.find_mut(pid) {
            Some(profile) => {
                let previous_binary = profile.browser.binary.clone();
                mutator(profile);
                keep_existing_binary(profile, &previous_binary);
                profile.last_used = unix_now();
                UpdateOutcome::Written
            }
            None => UpdateOutcome::NotFound,
        })
    }

    /// Attach the extension install id to the entry for `pid`.
    ///
    /// When another entry already carries `install_id` (left by an earlier
    /// run of the same install) its download roots are merged into ours and
    /// it is removed. Returns the updated profile, or `None` when there is
    /// no entry for `pid`.
    pub fn attach_install(
        &self,
        pid: u32,
        install_id: &str,
        extension_id: Option<&str>,
    ) -> BridgeResult<Option<Profile>> {
        self.mutate(|desc| {
            desc.find(pid)?;
            let previous = desc
                .profiles
                .iter()
                .position(|p| p.pid != pid && p.install_id.as_deref() == Some(install_id))
                .map(|idx| desc.profiles.remove(idx));

            let profile = desc.find_mut(pid)?;
            profile.install_id = Some(install_id.to_string());
            if let Some(ext) = extension_id {
                profile.extension_id = Some(ext.to_string());
                profile.browser.extension_id = Some(ext.to_string());
            }
            if let Some(previous) = previous {
                debug!(pid, old_pid = previous.pid, "Adopting roots from earlier run");
                if profile.browser.name.is_empty() {
                    profile.browser.name = previous.browser.name.clone();
                }
                keep_existing_binary(profile, &previous.browser.binary);
                profile.download_roots =
                    merge_roots(previous.download_roots, std::mem::take(&mut profile.download_roots));
            }
            profile.last_used = unix_now();
            Some(profile.clone())
        })
    }

    /// Remove entries whose process is gone.
    ///
    /// Dead entries without an install id are always dropped. Dead entries
    /// with an install id are kept (their roots are adopted on the next
    /// handshake) unless a live entry already carries the same install id.
    pub fn prune_dead(&self) -> BridgeResult<usize> {
        self.prune_with(pid_alive)
    }

    pub fn prune_with<F>(&self, is_alive: F) -> BridgeResult<usize>
    where
        F: Fn(u32) -> bool,
    {
        let removed = self.mutate(|desc| {
            let live_installs: Vec<String> = desc
                .profiles
                .iter()
                .filter(|p| is_alive(p.pid))
                .filter_map(|p| p.install_id.clone())
                .collect();
            let before = desc.profiles.len();
            desc.profiles.retain(|p| {
                if is_alive(p.pid) {
                    return true;
                }
                match &p.install_id {
                    None => false,
                    Some(id) => !live_installs.contains(id),
                }
            });
            before - desc.profiles.len()
        })?;
        if removed > 0 {
            debug!(removed, "Pruned dead profiles");
        }
        Ok(removed)
    }

    /// Locked read-modify-write of the whole descriptor.
    fn mutate<R>(&self, f: impl FnOnce(&mut DiscoveryDescriptor) -> R) -> BridgeResult<R> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| BridgeError::Discovery("descriptor path has no parent".into()))?;
        fs::create_dir_all(dir)?;

        let _lock = self.lock()?;
        let mut desc = self.read();
        let result = f(&mut desc);
        self.write_atomic(dir, &desc)?;
        Ok(result)
    }

    // Released when the returned file is dropped.
    fn lock(&self) -> BridgeResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        FileExt::lock_exclusive(&file).map_err(|e| {
            BridgeError::Discovery(format!("failed to lock {}: {}", self.lock_path.display(), e))
        })?;
        Ok(file)
    }

    fn write_atomic(&self, dir: &Path, desc: &DiscoveryDescriptor) -> BridgeResult<()> {
        let json = serde_json::to_string_pretty(desc)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Whether a process with this pid is currently running.
pub fn pid_alive(pid: u32) -> bool {
    use sysinfo::{Pid, System};

    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

/// Union of two root lists keyed by path; entries in `older` win so that
/// tokens the extension already stored stay valid.
fn merge_roots(older: Vec<DownloadRoot>, newer: Vec<DownloadRoot>) -> Vec<DownloadRoot> {
    let mut merged = older;
    for root in newer {
        if !merged.iter().any(|r| r.path == root.path) {
            merged.push(root);
        }
    }
    merged
}

/// A browser upgraded in place leaves its running process pointing at a
/// deleted binary; keep the last path that still exists.
fn keep_existing_binary(profile: &mut Profile, previous: &str) {
    if previous.is_empty() || profile.browser.binary == previous {
        return;
    }
    if !Path::new(&profile.browser.binary).exists() {
        profile.browser.binary = previous.to_string();
    }
}
