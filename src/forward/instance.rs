//! Forwarding instance: one rule, its listener loop and its lifecycle.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::config::{ForwardSettings, ForwardingConfig, Protocol};
use super::error::{ForwardError, ForwardResult, LastError, RelayError};
use super::state::InstanceState;
use super::stats::{ConnectionStats, StatsSnapshot};
use super::{tcp, udp};

/// Opaque instance identifier. Assigned once, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializable status snapshot of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub name: Option<String>,
    pub listen: String,
    pub target: String,
    pub protocol: Protocol,
    pub state: InstanceState,
    /// Bound listen address while a listener is active.
    pub local_addr: Option<SocketAddr>,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub last_error: Option<String>,
}

/// Everything a listener loop and its relays share with the owning instance.
pub(crate) struct LoopContext {
    pub(crate) id: InstanceId,
    pub(crate) name: String,
    pub(crate) target: String,
    pub(crate) settings: ForwardSettings,
    pub(crate) stats: Arc<ConnectionStats>,
    pub(crate) last_error: Arc<LastError>,
    /// Stop accepting new work.
    pub(crate) shutdown: CancellationToken,
    /// Close in-flight relays.
    pub(crate) force: CancellationToken,
    pub(crate) relays: TaskTracker,
    pub(crate) state: Arc<watch::Sender<InstanceState>>,
    /// Also receives listener failures, for callers that poll one shared slot.
    pub(crate) error_sink: Option<Arc<LastError>>,
}

impl LoopContext {
    /// Latch a per-connection failure into the instance's last error.
    pub(crate) fn connection_failed(&self, err: &RelayError) {
        self.last_error.record(err);
    }

    /// The listener died on its own. Falls back to `Stopped` unless a Stop is
    /// already in progress, which will finish the transition itself.
    pub(crate) fn listener_failed(&self, err: &io::Error) {
        error!(instance = %self.id, name = %self.name, error = %err, "Listener failed");
        let message = format!("listener for '{}' failed: {err}", self.name);
        if let Some(sink) = &self.error_sink {
            sink.record(&message);
        }
        self.last_error.record(message);
        self.state.send_if_modified(|state| {
            if *state == InstanceState::Running {
                *state = InstanceState::Stopped;
                true
            } else {
                false
            }
        });
    }
}

enum Bound {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Resources of one Start..Stop cycle.
struct RunHandle {
    shutdown: CancellationToken,
    force: CancellationToken,
    relays: TaskTracker,
    task: JoinHandle<()>,
}

/// One forwarding rule plus its runtime state.
///
/// All lifecycle transitions take the `run` lock, so Start, Stop and Destroy
/// on the same instance are serialized while status reads stay lock-free.
pub struct ForwardingInstance {
    id: InstanceId,
    config: ForwardingConfig,
    settings: ForwardSettings,
    state: Arc<watch::Sender<InstanceState>>,
    stats: Arc<ConnectionStats>,
    last_error: Arc<LastError>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    /// Parent of every run's tokens; cancelled on destroy or drop.
    root: CancellationToken,
    run: Mutex<Option<RunHandle>>,
    destroyed: AtomicBool,
    error_sink: Option<Arc<LastError>>,
}

impl ForwardingInstance {
    /// Create a stopped instance. Binds nothing.
    pub fn new(id: InstanceId, config: ForwardingConfig, settings: ForwardSettings) -> Self {
        let (state, _) = watch::channel(InstanceState::Stopped);
        Self {
            id,
            config,
            settings,
            state: Arc::new(state),
            stats: Arc::new(ConnectionStats::new()),
            last_error: Arc::new(LastError::new()),
            local_addr: std::sync::Mutex::new(None),
            root: CancellationToken::new(),
            run: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            error_sink: None,
        }
    }

    /// Copy listener failures into `sink` as well as the instance's own slot.
    #[must_use]
    pub fn with_error_sink(mut self, sink: Arc<LastError>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &ForwardingConfig {
        &self.config
    }

    pub fn settings(&self) -> &ForwardSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    /// `true` while a listener loop is active.
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.is_running() {
            *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
        } else {
            None
        }
    }

    /// Most recent failure seen by this instance.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    /// Point-in-time status.
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id,
            name: self.config.name.clone(),
            listen: self.config.listen.clone(),
            target: self.config.target.clone(),
            protocol: self.config.protocol,
            state: self.state(),
            local_addr: self.local_addr(),
            stats: self.stats.snapshot(),
            last_error: self.last_error(),
        }
    }

    /// Bind the listen endpoint and start the listener loop.
    ///
    /// Returns once the endpoint is accepting, with the bound address.
    ///
    /// # Errors
    ///
    /// `NotFound` after destroy, `AlreadyRunning` if a listener is active, or
    /// `BindFailed` (the instance stays `Stopped`).
    pub async fn start(&self) -> ForwardResult<SocketAddr> {
        let mut run = self.run.lock().await;

        if self.destroyed.load(Ordering::Acquire) {
            return Err(ForwardError::NotFound(self.id));
        }
        if self.is_running() {
            return Err(ForwardError::AlreadyRunning(self.id));
        }
        // A loop that died on a fatal error leaves its handle behind.
        if let Some(dead) = run.take() {
            self.wind_down(dead).await;
        }

        self.state.send_replace(InstanceState::Starting);

        let bound = match self.config.protocol {
            Protocol::Tcp => tcp::bind_tcp(&self.config.listen)
                .await
                .map(|(listener, addr)| (Bound::Tcp(listener), addr)),
            Protocol::Udp => udp::bind_udp(&self.config.listen)
                .await
                .map(|(socket, addr)| (Bound::Udp(socket), addr)),
        };

        let (bound, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                warn!(
                    instance = %self.id,
                    listen = %self.config.listen,
                    error = %e,
                    "Failed to start forwarding instance"
                );
                self.last_error.record(&e);
                self.state.send_replace(InstanceState::Stopped);
                return Err(e);
            },
        };

        let ctx = self.loop_context();
        let shutdown = ctx.shutdown.clone();
        let force = ctx.force.clone();
        let relays = ctx.relays.clone();

        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        self.state.send_replace(InstanceState::Running);

        let task = match bound {
            Bound::Tcp(listener) => tokio::spawn(tcp::run_tcp_loop(listener, ctx)),
            Bound::Udp(socket) => tokio::spawn(udp::run_udp_loop(socket, ctx)),
        };

        *run = Some(RunHandle {
            shutdown,
            force,
            relays,
            task,
        });

        info!(
            instance = %self.id,
            name = %self.config.display_name(),
            protocol = %self.config.protocol,
            listen = %local_addr,
            target = %self.config.target,
            "Forwarding instance started"
        );

        Ok(local_addr)
    }

    /// Fresh context for one run, with tokens parented to this instance.
    pub(crate) fn loop_context(&self) -> LoopContext {
        LoopContext {
            id: self.id,
            name: self.config.display_name().to_string(),
            target: self.config.target.clone(),
            settings: self.settings.clone(),
            stats: Arc::clone(&self.stats),
            last_error: Arc::clone(&self.last_error),
            shutdown: self.root.child_token(),
            force: self.root.child_token(),
            relays: TaskTracker::new(),
            state: Arc::clone(&self.state),
            error_sink: self.error_sink.clone(),
        }
    }

    /// Stop accepting and close the listen endpoint.
    ///
    /// In-flight relays get `drain_timeout` to finish in the background
    /// before they are closed.
    ///
    /// # Errors
    ///
    /// `NotFound` after destroy, `NotRunning` if no listener is active.
    pub async fn stop(&self) -> ForwardResult<()> {
        let mut run = self.run.lock().await;

        if self.destroyed.load(Ordering::Acquire) {
            return Err(ForwardError::NotFound(self.id));
        }

        let handle = match run.take() {
            Some(handle) if self.state() == InstanceState::Running => handle,
            other => {
                if let Some(dead) = other {
                    self.wind_down(dead).await;
                }
                return Err(ForwardError::NotRunning(self.id));
            },
        };

        self.state.send_replace(InstanceState::Stopping);
        self.wind_down(handle).await;
        self.state.send_replace(InstanceState::Stopped);

        info!(
            instance = %self.id,
            name = %self.config.display_name(),
            draining = self.stats.active_connections(),
            "Forwarding instance stopped"
        );

        Ok(())
    }

    /// Mark the instance destroyed and cancel anything still draining.
    ///
    /// # Errors
    ///
    /// `NotFound` if already destroyed, `StillRunning` unless stopped.
    pub(crate) async fn retire(&self) -> ForwardResult<()> {
        let mut run = self.run.lock().await;

        if self.destroyed.load(Ordering::Acquire) {
            return Err(ForwardError::NotFound(self.id));
        }
        if !self.state().is_stopped() {
            return Err(ForwardError::StillRunning(self.id));
        }
        if let Some(dead) = run.take() {
            self.wind_down(dead).await;
        }

        self.destroyed.store(true, Ordering::Release);
        self.root.cancel();

        info!(instance = %self.id, name = %self.config.display_name(), "Forwarding instance destroyed");
        Ok(())
    }

    /// Signal the loop, wait for it to release the listen endpoint, then
    /// leave the relays to drain under the grace period.
    async fn wind_down(&self, handle: RunHandle) {
        let RunHandle {
            shutdown,
            force,
            relays,
            task,
        } = handle;

        shutdown.cancel();
        if let Err(e) = task.await {
            if e.is_panic() {
                error!(instance = %self.id, "Listener loop panicked");
                self.last_error.record("listener loop panicked");
            }
        }

        relays.close();
        if relays.is_empty() {
            return;
        }

        let id = self.id;
        let drain = self.settings.drain_timeout;
        tokio::spawn(async move {
            if timeout(drain, relays.wait()).await.is_err() {
                warn!(
                    instance = %id,
                    remaining = relays.len(),
                    "Drain period elapsed, closing remaining relays"
                );
                force.cancel();
            }
        });
    }
}

impl Drop for ForwardingInstance {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl std::fmt::Debug for ForwardingInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingInstance")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn instance(config: ForwardingConfig) -> ForwardingInstance {
        ForwardingInstance::new(InstanceId::from_raw(1), config, ForwardSettings::default())
    }

    #[test]
    fn test_instance_id() {
        let id = InstanceId::from_raw(42);
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
    }

    #[tokio::test]
    async fn test_new_instance_is_stopped() {
        let inst = instance(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"));
        assert_eq!(inst.state(), InstanceState::Stopped);
        assert!(!inst.is_running());
        assert!(inst.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let inst = instance(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"));

        let addr = inst.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(inst.local_addr(), Some(addr));
        assert!(matches!(inst.start().await, Err(ForwardError::AlreadyRunning(_))));

        inst.stop().await.unwrap();
        assert_eq!(inst.state(), InstanceState::Stopped);
        assert!(inst.local_addr().is_none());
        assert!(matches!(inst.stop().await, Err(ForwardError::NotRunning(_))));

        // Restartable after stop.
        inst.start().await.unwrap();
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_reverts_to_stopped() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap().to_string();

        let inst = instance(ForwardingConfig::tcp(taken, "127.0.0.1:9"));
        let err = inst.start().await.unwrap_err();
        assert!(matches!(err, ForwardError::BindFailed { .. }));
        assert_eq!(inst.state(), InstanceState::Stopped);
        assert!(inst.last_error().unwrap().contains("Failed to bind"));
    }

    #[tokio::test]
    async fn test_retire_rules() {
        let inst = instance(ForwardingConfig::udp("127.0.0.1:0", "127.0.0.1:9"));
        inst.start().await.unwrap();
        assert!(matches!(inst.retire().await, Err(ForwardError::StillRunning(_))));

        inst.stop().await.unwrap();
        inst.retire().await.unwrap();
        assert!(matches!(inst.start().await, Err(ForwardError::NotFound(_))));
        assert!(matches!(inst.stop().await, Err(ForwardError::NotFound(_))));
        assert!(matches!(inst.retire().await, Err(ForwardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_watch_state_sees_transitions() {
        let inst = instance(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"));
        let mut rx = inst.watch_state();

        inst.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == InstanceState::Running))
            .await
            .unwrap()
            .unwrap();

        inst.stop().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let config = ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9").with_name("web");
        let inst = instance(config);
        inst.start().await.unwrap();

        let status = inst.status();
        assert_eq!(status.name.as_deref(), Some("web"));
        assert_eq!(status.state, InstanceState::Running);
        assert!(status.local_addr.is_some());
        assert_eq!(status.stats.active_connections, 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["protocol"], "tcp");
        assert_eq!(json["active_connections"], 0);

        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_failure_reverts_and_restart_reaps_dead_run() {
        let sink = Arc::new(LastError::new());
        let inst = instance(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"))
            .with_error_sink(Arc::clone(&sink));
        inst.start().await.unwrap();

        inst.loop_context()
            .listener_failed(&io::Error::from(io::ErrorKind::InvalidInput));

        assert_eq!(inst.state(), InstanceState::Stopped);
        assert!(!inst.is_running());
        assert!(inst.local_addr().is_none());
        let message = inst.last_error().unwrap();
        assert!(message.contains("listener for '127.0.0.1:0' failed"), "{message}");
        assert_eq!(sink.get(), Some(message));

        // The dead run's handle is still parked and is reaped by the next start.
        let addr = inst.start().await.unwrap();
        assert_eq!(inst.state(), InstanceState::Running);
        assert_eq!(inst.local_addr(), Some(addr));
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_failure_during_stop_leaves_state_to_stop() {
        let inst = instance(ForwardingConfig::udp("127.0.0.1:0", "127.0.0.1:9"));
        inst.start().await.unwrap();
        inst.state.send_replace(InstanceState::Stopping);

        inst.loop_context()
            .listener_failed(&io::Error::from(io::ErrorKind::InvalidInput));
        assert_eq!(inst.state(), InstanceState::Stopping);

        inst.state.send_replace(InstanceState::Running);
        inst.stop().await.unwrap();
    }
}
