//! i2p daemon lifecycle
//!
//! Drives the native daemon through [`DaemonBridge`] and tracks its state:
//!
//! ```text
//! Stopped -> Starting -> BuildingTunnels -> Ready
//!               |              |
//!               +----> Error <-+
//! ```
//!
//! `Error` is terminal until the caller restarts or stops the daemon.
//! State changes and errors are published on a broadcast channel; a
//! subscriber never holds the manager alive.

use super::bridge::{DaemonBridge, START_OK};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to start i2pd: {0}")]
    StartFailed(String),

    #[error("Daemon not ready after {0:?}")]
    ReadinessTimeout(Duration),

    #[error("Start cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Daemon lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Stopped,
    Starting,
    WaitingForNetwork,
    BuildingTunnels,
    Ready,
    Error,
}

impl DaemonState {
    pub fn can_transition_to(self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, WaitingForNetwork)
                | (Starting, BuildingTunnels)
                | (Starting, Error)
                | (Starting, Stopped)
                | (WaitingForNetwork, BuildingTunnels)
                | (WaitingForNetwork, Error)
                | (WaitingForNetwork, Stopped)
                | (BuildingTunnels, Ready)
                | (BuildingTunnels, Error)
                | (BuildingTunnels, Stopped)
                | (Ready, Stopped)
                | (Error, Stopped)
        )
    }

    /// Started and not yet stopped or failed
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DaemonState::Starting
                | DaemonState::WaitingForNetwork
                | DaemonState::BuildingTunnels
                | DaemonState::Ready
        )
    }
}

/// Published on every transition and every error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    StateChanged { from: DaemonState, to: DaemonState },
    Error(String),
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Data directory for daemon state
    pub data_dir: PathBuf,

    /// SAM API port
    pub sam_port: u16,

    /// Enable IPv6 support
    pub enable_ipv6: bool,

    /// Bandwidth limit in KB/s (None = unlimited)
    pub bandwidth_limit_kbps: Option<u32>,

    /// Number of transit tunnels to support
    pub transit_tunnels: u32,

    /// Web console port
    pub web_console_port: u16,

    /// Path to i2pd binary (auto-detect if None)
    pub i2pd_binary: Option<PathBuf>,

    /// Interval between readiness checks
    pub poll_interval_ms: u64,

    /// Readiness checks before the start is declared failed
    pub poll_attempts: u32,

    /// Default bound for [`DaemonManager::wait_for_ready`]
    pub ready_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            data_dir: Self::default_data_dir(),
            sam_port: 7656,
            enable_ipv6: false,
            bandwidth_limit_kbps: Some(1024),
            transit_tunnels: 50,
            web_console_port: 7070,
            i2pd_binary: None,
            poll_interval_ms: 1000,
            poll_attempts: 60,
            ready_timeout_secs: 300,
        }
    }
}

impl DaemonConfig {
    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("veilmsg")
            .join("i2p")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("i2pd.conf")
    }

    /// Generate i2pd configuration file contents
    pub fn generate_config(&self) -> String {
        let mut config = format!(
            r#"# Auto-generated i2pd configuration for veilmsg
# Generated at: {}

datadir = {}

log = file
loglevel = warn
logfile = i2pd.log

ipv4 = true
ipv6 = {}
notransit = false

[sam]
enabled = true
address = 127.0.0.1
port = {}

[http]
enabled = true
address = 127.0.0.1
port = {}

[httpproxy]
enabled = false

[socksproxy]
enabled = false

[upnp]
enabled = false

[limits]
transittunnels = {}
"#,
            chrono::Utc::now(),
            self.data_dir.display(),
            self.enable_ipv6,
            self.sam_port,
            self.web_console_port,
            self.transit_tunnels,
        );

        if let Some(limit) = self.bandwidth_limit_kbps {
            config.push_str(&format!("ntcpsoft = {}\nntcphard = {}\n", limit, limit));
        }

        config
    }

    /// Write `i2pd.conf` into the data directory
    pub fn write_config(&self) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.data_dir)?;
        let path = self.config_path();
        fs::write(&path, self.generate_config())?;
        Ok(path)
    }
}

struct Inner {
    config: DaemonConfig,
    bridge: Arc<dyn DaemonBridge>,
    state: RwLock<DaemonState>,
    running: AtomicBool,
    ready: AtomicBool,
    cancel: std::sync::Mutex<CancellationToken>,
    lifecycle: Mutex<()>,
    events: broadcast::Sender<DaemonEvent>,
}

impl Inner {
    /// Apply a transition if the table allows it
    async fn transition(&self, to: DaemonState) -> bool {
        let mut state = self.state.write().await;
        let from = *state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            log::debug!("Ignoring daemon transition {:?} -> {:?}", from, to);
            return false;
        }
        *state = to;
        drop(state);

        log::info!("i2p daemon: {:?} -> {:?}", from, to);
        let _ = self.events.send(DaemonEvent::StateChanged { from, to });
        true
    }

    fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("i2p daemon error: {}", message);
        let _ = self.events.send(DaemonEvent::Error(message));
    }

    fn current_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut current) => *current = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }

    async fn stop_native(&self) {
        let bridge = self.bridge.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || bridge.stop_daemon()).await {
            log::warn!("i2pd stop failed: {}", e);
        }
        self.running.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }
}

/// Owns the daemon and its lifecycle state. Cheap to clone.
#[derive(Clone)]
pub struct DaemonManager {
    inner: Arc<Inner>,
}

impl DaemonManager {
    pub fn new(config: DaemonConfig, bridge: Arc<dyn DaemonBridge>) -> Self {
        let (events, _) = broadcast::channel(64);
        DaemonManager {
            inner: Arc::new(Inner {
                config,
                bridge,
                state: RwLock::new(DaemonState::Stopped),
                running: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                cancel: std::sync::Mutex::new(CancellationToken::new()),
                lifecycle: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> DaemonState {
        *self.inner.state.read().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Receive every subsequent state change and error
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.inner.events.subscribe()
    }

    /// Start the daemon. Returns once the native start call has succeeded;
    /// readiness is reported later through the state (see
    /// [`wait_for_ready`](Self::wait_for_ready)).
    ///
    /// Does nothing if the daemon is already running. A start from `Error`
    /// resets to `Stopped` first.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let state = self.state().await;
        if self.is_running() || state.is_active() {
            return Ok(());
        }
        if state == DaemonState::Error {
            inner.transition(DaemonState::Stopped).await;
        }

        let cancel = inner.replace_token();
        inner.ready.store(false, Ordering::SeqCst);

        let config = inner.config.clone();
        let bridge = inner.bridge.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            let path = config.write_config()?;
            bridge.set_data_dir(&config.data_dir);
            Ok::<_, std::io::Error>(path)
        })
        .await
        .map_err(|e| DaemonError::Task(e.to_string()))?;

        match prepared {
            Ok(path) => log::debug!("Wrote {}", path.display()),
            Err(e) => {
                inner.emit_error(format!("config: {}", e));
                return Err(DaemonError::ConfigError(e.to_string()));
            }
        }

        inner.transition(DaemonState::Starting).await;

        let bridge = inner.bridge.clone();
        let result = match tokio::task::spawn_blocking(move || bridge.start_daemon()).await {
            Ok(result) => result,
            Err(e) => e.to_string(),
        };

        if cancel.is_cancelled() {
            if result == START_OK {
                inner.stop_native().await;
            }
            inner.transition(DaemonState::Stopped).await;
            return Err(DaemonError::Cancelled);
        }

        if result != START_OK {
            inner.transition(DaemonState::Error).await;
            inner.emit_error(result.clone());
            return Err(DaemonError::StartFailed(result));
        }

        inner.running.store(true, Ordering::SeqCst);
        inner.transition(DaemonState::BuildingTunnels).await;

        tokio::spawn(poll_readiness(inner.clone(), cancel));
        Ok(())
    }

    /// Wait until the daemon reports ready or `timeout` elapses.
    ///
    /// Only watches the readiness flag. Fails early if the start itself
    /// failed; a readiness poll that gave up does not end the wait, since
    /// the daemon may still come up within `timeout`.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let step = self
            .inner
            .config
            .poll_interval()
            .min(Duration::from_millis(250));

        loop {
            if self.is_ready() {
                return Ok(());
            }

            let state = self.state().await;
            if !self.is_running() && !state.is_active() {
                return Err(DaemonError::StartFailed(format!(
                    "daemon is {:?}",
                    state
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DaemonError::ReadinessTimeout(timeout));
            }
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }

    /// Stop the daemon. Stop failures are logged, not returned.
    pub async fn stop(&self) {
        let inner = &self.inner;

        // Unblocks an in-flight start or readiness poll
        inner.current_token().cancel();
        let _lifecycle = inner.lifecycle.lock().await;

        let state = self.state().await;
        if !self.is_running() && state == DaemonState::Stopped {
            return;
        }

        if self.is_running() {
            inner.stop_native().await;
        }
        inner.ready.store(false, Ordering::SeqCst);
        inner.transition(DaemonState::Stopped).await;
    }

    /// Web console URL of the running daemon
    pub async fn web_console_addr(&self) -> String {
        let bridge = self.inner.bridge.clone();
        tokio::task::spawn_blocking(move || bridge.get_web_console_addr())
            .await
            .unwrap_or_default()
    }
}

async fn poll_readiness(inner: Arc<Inner>, cancel: CancellationToken) {
    let interval = inner.config.poll_interval();
    let attempts = inner.config.poll_attempts.max(1);
    let mut attempt = 0u32;
    let mut reported = false;

    loop {
        let bridge = inner.bridge.clone();
        let up = tokio::select! {
            _ = cancel.cancelled() => return,
            state = tokio::task::spawn_blocking(move || bridge.get_sam_state()) => {
                state.unwrap_or(false)
            }
        };

        if up {
            inner.ready.store(true, Ordering::SeqCst);
            if !reported {
                inner.transition(DaemonState::Ready).await;
            } else {
                log::info!("SAM bridge came up after the readiness poll gave up");
            }
            return;
        }

        attempt += 1;
        if attempt == attempts && !reported {
            reported = true;
            if inner.transition(DaemonState::Error).await {
                inner.emit_error("timeout");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
