//! UDP pseudo-connections: client source address to upstream socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::RelayError;
use super::stats::ConnectionStats;

/// Datagrams buffered per session while its upstream socket is being set up
/// or is slower than the client.
pub const SESSION_QUEUE_DEPTH: usize = 64;

/// One client's pseudo-connection.
///
/// The receive loop only queues datagrams here. The session's own task
/// resolves and connects the upstream socket, drains the queue into it and
/// routes replies back to the client.
#[derive(Debug)]
pub struct UdpSession {
    client: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    created_at: Instant,
    /// Nanoseconds after `created_at` of the last datagram in either direction.
    last_activity: AtomicU64,
    cancel: CancellationToken,
    datagrams_to_target: AtomicU64,
    datagrams_to_client: AtomicU64,
}

impl UdpSession {
    /// Create a session for `client`. The receiver is the session task's end
    /// of the outbound queue; `cancel` ends that task.
    pub fn new(client: SocketAddr, cancel: CancellationToken) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, queue) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let session = Self {
            client,
            outbound,
            created_at: Instant::now(),
            last_activity: AtomicU64::new(0),
            cancel,
            datagrams_to_target: AtomicU64::new(0),
            datagrams_to_client: AtomicU64::new(0),
        };
        (session, queue)
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queue a datagram for the target without waiting.
    ///
    /// Returns `false` if the queue is full or the session has ended.
    pub fn enqueue(&self, data: &[u8]) -> bool {
        let queued = self.outbound.try_send(data.to_vec()).is_ok();
        if queued {
            self.touch();
        }
        queued
    }

    /// Mark activity now.
    pub fn touch(&self) {
        let offset = self.created_at.elapsed().as_nanos();
        self.last_activity
            .store(u64::try_from(offset).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_to_target(&self) {
        self.datagrams_to_target.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_to_client(&self) {
        self.datagrams_to_client.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Time since the last datagram, measured against `now`.
    #[must_use]
    pub fn idle_at(&self, now: Instant) -> Duration {
        let last = self.created_at
            + Duration::from_nanos(self.last_activity.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    /// Datagrams relayed (to target, to client).
    pub fn datagrams(&self) -> (u64, u64) {
        (
            self.datagrams_to_target.load(Ordering::Relaxed),
            self.datagrams_to_client.load(Ordering::Relaxed),
        )
    }
}

/// Bounded map of live UDP sessions for one instance.
///
/// Every session leaving the table has its token cancelled, which ends its
/// task and closes the upstream socket.
#[derive(Debug)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SocketAddr, Arc<UdpSession>>>,
    max_sessions: usize,
    idle_timeout: Duration,
    stats: Arc<ConnectionStats>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new(max_sessions: usize, idle_timeout: Duration, stats: Arc<ConnectionStats>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            idle_timeout,
            stats,
        }
    }

    /// Look up the session for a client.
    pub async fn get(&self, client: &SocketAddr) -> Option<Arc<UdpSession>> {
        self.sessions.read().await.get(client).cloned()
    }

    /// Register a new session.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionLimit` when the table is full.
    pub async fn insert(&self, session: Arc<UdpSession>) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_sessions && !sessions.contains_key(&session.client) {
            return Err(RelayError::SessionLimit {
                limit: self.max_sessions,
            });
        }

        if let Some(previous) = sessions.insert(session.client, session) {
            previous.cancel.cancel();
        }
        self.stats.set_udp_sessions(sessions.len());
        Ok(())
    }

    /// Remove `session` if it is still the one registered for its client.
    pub async fn remove_if_same(&self, session: &Arc<UdpSession>) -> bool {
        let mut sessions = self.sessions.write().await;

        let same = sessions
            .get(&session.client)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if same {
            sessions.remove(&session.client);
            session.cancel.cancel();
            self.stats.set_udp_sessions(sessions.len());
        }
        same
    }

    /// Drop sessions idle for longer than the timeout. Returns how many went.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|client, session| {
            if session.idle_at(now) > self.idle_timeout {
                debug!(peer = %client, "UDP session idle, evicting");
                session.cancel.cancel();
                false
            } else {
                true
            }
        });

        self.stats.set_udp_sessions(sessions.len());
        before - sessions.len()
    }

    /// Cancel and drop every session.
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values() {
            session.cancel.cancel();
        }
        sessions.clear();
        self.stats.set_udp_sessions(0);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
