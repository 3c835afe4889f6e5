//! Shared host state and process wiring
//!
//! ```text
//!           stdin/stdout                        127.0.0.1:<port>
//!                │                                     │
//!        ┌───────▼────────┐                 ┌──────────▼───────────┐
//!        │ control::serve │◄──── Event ─────│ gateway::router      │
//!        └───────┬────────┘                 │  /read /write /hash  │
//!                │                          │  /io  (RelaySession) │
//!                │        Arc<HostState>    └──────────┬───────────┘
//!                └─────────────┬───────────────────────┘
//!                              ▼
//!             token · download roots · DiscoveryStore · stats
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::{random_token, SessionToken};
use crate::config::{HostConfig, RelayConfig};
use crate::control::{self, DaemonInfo, Event};
use crate::discovery::{DiscoveryStore, UpdateOutcome};
use crate::error::{BridgeError, BridgeResult};
use crate::gateway;
use crate::paths;
use crate::relay::{RelayStats, StatsSnapshot};
use crate::types::{unix_now, BrowserInfo, DownloadRoot, Profile, DESCRIPTOR_VERSION};

/// Events buffered towards the control channel
const EVENT_QUEUE: usize = 64;

/// Everything the control channel and the data plane share.
#[derive(Debug)]
pub struct HostState {
    token: SessionToken,
    pid: u32,
    salt: String,
    port: u16,
    started: u64,
    browser: RwLock<BrowserInfo>,
    install_id: RwLock<Option<String>>,
    store: DiscoveryStore,
    roots: RwLock<Vec<DownloadRoot>>,
    events: mpsc::Sender<Event>,
    stats: Arc<RelayStats>,
    relay: RelayConfig,
    allowed_origins: Vec<String>,
}

impl HostState {
    /// Build the state for a data plane listening on `port`. The returned
    /// receiver yields events destined for the control channel.
    pub fn new(
        config: &HostConfig,
        port: u16,
        mut browser: BrowserInfo,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        if browser.extension_id.is_none() {
            browser.extension_id = config.extension_id.clone();
        }

        // Health is filled in by `register`, off the runtime threads
        let roots = config
            .download_root
            .iter()
            .map(|path| DownloadRoot::new(path.clone(), display_name_for(path)))
            .collect();

        let state = Self {
            token: SessionToken::generate(),
            pid: std::process::id(),
            salt: random_token(16),
            port,
            started: unix_now(),
            browser: RwLock::new(browser),
            install_id: RwLock::new(None),
            store: DiscoveryStore::in_config_dir(&config.config_dir),
            roots: RwLock::new(roots),
            events,
            stats: Arc::new(RelayStats::default()),
            relay: config.relay.clone(),
            allowed_origins: config.allowed_origins.clone(),
        };
        (Arc::new(state), events_rx)
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn store(&self) -> &DiscoveryStore {
        &self.store
    }

    pub fn relay_config(&self) -> &RelayConfig {
        &self.relay
    }

    pub fn relay_stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn uptime_secs(&self) -> u64 {
        unix_now().saturating_sub(self.started)
    }

    /// This process's entry as it should appear in the descriptor.
    pub fn profile(&self) -> Profile {
        let browser = self.browser.read().clone();
        Profile {
            install_id: self.install_id.read().clone(),
            extension_id: browser.extension_id.clone(),
            salt: self.salt.clone(),
            pid: self.pid,
            port: self.port,
            token: self.token.as_str().to_string(),
            started: self.started,
            last_used: unix_now(),
            browser,
            download_roots: self.roots(),
        }
    }

    pub fn daemon_info(&self) -> DaemonInfo {
        DaemonInfo {
            port: self.port,
            token: self.token.as_str().to_string(),
            version: DESCRIPTOR_VERSION,
            roots: self.roots(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Download roots
    // ═══════════════════════════════════════════════════════════════════════

    pub fn roots(&self) -> Vec<DownloadRoot> {
        self.roots.read().clone()
    }

    pub fn root(&self, token: &str) -> BridgeResult<DownloadRoot> {
        self.roots
            .read()
            .iter()
            .find(|r| r.token == token)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownRoot(token.to_string()))
    }

    /// The root used by control-channel file ops.
    pub fn default_root(&self) -> BridgeResult<DownloadRoot> {
        self.roots
            .read()
            .first()
            .cloned()
            .ok_or_else(|| BridgeError::NotFound("no download root configured".into()))
    }

    /// Resolve `relative` inside the root named by `token`.
    pub fn resolve(&self, token: &str, relative: &str) -> BridgeResult<PathBuf> {
        let root = self.root(token)?;
        paths::resolve(&root.path, relative)
    }

    pub fn resolve_default(&self, relative: &str) -> BridgeResult<PathBuf> {
        let root = self.default_root()?;
        paths::resolve(&root.path, relative)
    }

    pub async fn add_root(
        &self,
        path: &Path,
        display_name: Option<String>,
        removable: bool,
    ) -> BridgeResult<DownloadRoot> {
        let path = path.to_path_buf();
        let candidate = run_blocking(move || {
            let canonical = path.canonicalize().map_err(|e| {
                BridgeError::Validation(format!("cannot use {} as a root: {}", path.display(), e))
            })?;
            if !canonical.is_dir() {
                return Err(BridgeError::Validation(format!(
                    "{} is not a directory",
                    canonical.display()
                )));
            }
            let name = display_name.unwrap_or_else(|| display_name_for(&canonical));
            let mut root = DownloadRoot::new(canonical, name);
            root.removable = removable;
            root.refresh_health();
            Ok(root)
        })
        .await?;

        let root = {
            let mut roots = self.roots.write();
            if let Some(existing) = roots.iter().find(|r| r.path == candidate.path) {
                return Ok(existing.clone());
            }
            roots.push(candidate.clone());
            candidate
        };
        info!(token = %root.token, path = %root.path.display(), "Added download root");
        self.persist_roots().await?;
        Ok(root)
    }

    pub async fn remove_root(&self, token: &str) -> BridgeResult<()> {
        let removed = {
            let mut roots = self.roots.write();
            let before = roots.len();
            roots.retain(|r| r.token != token);
            before != roots.len()
        };
        if !removed {
            return Err(BridgeError::UnknownRoot(token.to_string()));
        }
        info!(%token, "Removed download root");
        self.persist_roots().await
    }

    /// Stat every root, record the result and persist it.
    pub async fn refresh_roots(&self) -> BridgeResult<Vec<DownloadRoot>> {
        let snapshot = self.check_health().await?;
        self.persist_roots().await?;
        Ok(snapshot)
    }

    /// Stat a copy of the roots on the blocking pool, then store the
    /// results. Roots added or removed meanwhile are left as they are.
    async fn check_health(&self) -> BridgeResult<Vec<DownloadRoot>> {
        let unchecked = self.roots();
        let checked = run_blocking(move || {
            Ok(unchecked
                .into_iter()
                .map(|mut root| {
                    root.refresh_health();
                    root
                })
                .collect::<Vec<_>>())
        })
        .await?;

        let mut roots = self.roots.write();
        for root in roots.iter_mut() {
            if let Some(fresh) = checked.iter().find(|c| c.token == root.token) {
                root.last_stat_ok = fresh.last_stat_ok;
                root.last_checked = fresh.last_checked;
            }
        }
        Ok(roots.clone())
    }

    /// Replace the in-memory roots with what the descriptor holds for this
    /// pid. Returns the number of roots loaded.
    pub async fn reload_roots_from_disk(&self) -> BridgeResult<usize> {
        let pid = self.pid;
        let desc = self.blocking(|store| Ok(store.read())).await?;
        let profile = desc
            .find(pid)
            .ok_or_else(|| BridgeError::NotFound(format!("no descriptor entry for pid {}", pid)))?;
        let count = profile.download_roots.len();
        *self.roots.write() = profile.download_roots.clone();
        info!(count, "Reloaded download roots from descriptor");
        Ok(count)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Discovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Check root health, prune dead entries and write this process's
    /// profile.
    pub async fn register(&self) -> BridgeResult<()> {
        for root in self.check_health().await? {
            if !root.last_stat_ok {
                warn!(path = %root.path.display(), "Download root is not a directory");
            }
        }
        let profile = self.profile();
        self.blocking(move |store| {
            if let Err(e) = store.prune_dead() {
                warn!(error = %e, "Failed to prune discovery descriptor");
            }
            store.register(profile)
        })
        .await
    }

    /// Attach the extension identity to this process's profile and return
    /// what the extension needs to reach the data plane.
    pub async fn handshake(
        &self,
        install_id: Option<String>,
        extension_id: Option<String>,
    ) -> BridgeResult<DaemonInfo> {
        if let Some(ext) = &extension_id {
            self.browser.write().extension_id = Some(ext.clone());
        }

        if let Some(install_id) = install_id {
            *self.install_id.write() = Some(install_id.clone());
            let pid = self.pid;
            let profile = self.profile();
            let updated = self
                .blocking(move |store| {
                    let ext = extension_id.as_deref();
                    match store.attach_install(pid, &install_id, ext)? {
                        Some(updated) => Ok(updated),
                        None => {
                            // Our entry vanished (file deleted by hand); recreate it
                            store.register(profile)?;
                            store
                                .attach_install(pid, &install_id, ext)?
                                .ok_or_else(|| BridgeError::Discovery("profile disappeared".into()))
                        }
                    }
                })
                .await?;
            *self.roots.write() = updated.download_roots;
            info!(pid, "Handshake attached install id");
        } else if let Some(ext) = extension_id {
            self.update_profile(move |p| {
                p.extension_id = Some(ext.clone());
                p.browser.extension_id = Some(ext);
            })
            .await?;
        }

        self.refresh_roots().await?;
        Ok(self.daemon_info())
    }

    async fn persist_roots(&self) -> BridgeResult<()> {
        let roots = self.roots();
        self.update_profile(move |p| p.download_roots = roots).await
    }

    async fn update_profile<F>(&self, mutator: F) -> BridgeResult<()>
    where
        F: FnOnce(&mut Profile) + Send + 'static,
    {
        let pid = self.pid;
        let fallback = self.profile();
        self.blocking(move |store| match store.update(pid, mutator)? {
            UpdateOutcome::Written => Ok(()),
            UpdateOutcome::NotFound => {
                warn!(pid, "Profile missing from descriptor, registering again");
                store.register(fallback)
            }
        })
        .await
    }

    async fn blocking<R, F>(&self, f: F) -> BridgeResult<R>
    where
        F: FnOnce(&DiscoveryStore) -> BridgeResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.store.clone();
        run_blocking(move || f(&store)).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Events
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue an event for the extension.
    pub async fn emit(&self, event: Event) -> BridgeResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| {
                BridgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "control channel is closed",
                ))
            })
    }
}

/// Run filesystem work on the blocking pool.
async fn run_blocking<R, F>(f: F) -> BridgeResult<R>
where
    F: FnOnce() -> BridgeResult<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::Io(std::io::Error::other(format!("blocking task failed: {}", e))))?
}

fn display_name_for(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// A bound, registered host ready to serve.
pub struct Host {
    state: Arc<HostState>,
    events: mpsc::Receiver<Event>,
    listener: TcpListener,
}

impl Host {
    /// Bind the data-plane listener and register this process in the
    /// discovery descriptor. Failing to bind is fatal for the process.
    pub async fn bind(config: HostConfig, browser: BrowserInfo) -> BridgeResult<Self> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind, config.port)).await?;
        let port = listener.local_addr()?.port();
        let (state, events) = HostState::new(&config, port, browser);
        state.register().await?;
        info!(
            port,
            pid = state.pid(),
            descriptor = %state.store().path().display(),
            "Data plane listening"
        );
        Ok(Self {
            state,
            events,
            listener,
        })
    }

    pub fn state(&self) -> &Arc<HostState> {
        &self.state
    }

    /// Serve the data plane in the background and the control channel on
    /// `input`/`output` until the input ends.
    pub async fn run<R, W>(self, input: R, output: W) -> BridgeResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        let app = gateway::router(self.state.clone());
        let listener = self.listener;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Data plane server stopped");
            }
        });

        let result = control::serve(self.state.clone(), input, output, self.events).await;
        server.abort();
        info!("Control channel closed, shutting down");
        result
    }
}
