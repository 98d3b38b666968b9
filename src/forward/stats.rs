//! Per-instance traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic counters shared by an instance's listener loop and relays.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total connections (or UDP sessions) established.
    pub connections_total: AtomicU64,
    /// Currently active relays.
    pub connections_active: AtomicU64,
    /// Bytes copied from clients to the target.
    pub bytes_to_target: AtomicU64,
    /// Bytes copied from the target back to clients.
    pub bytes_to_client: AtomicU64,
    /// Failed or timed-out dials.
    pub dial_failures: AtomicU64,
    /// Relays that ended with a read/write error.
    pub connection_errors: AtomicU64,
    /// Clients or datagrams turned away by a limit.
    pub rejected: AtomicU64,
    /// Live UDP pseudo-connections.
    pub udp_sessions: AtomicU64,
}

impl ConnectionStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new relay and hold it active until the guard drops.
    pub fn open(self: &Arc<Self>) -> ActiveConnectionGuard {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        ActiveConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn add_to_target(&self, bytes: u64) {
        self.bytes_to_target.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_udp_sessions(&self, count: usize) {
        self.udp_sessions.store(count as u64, Ordering::Relaxed);
    }

    /// Get current active connections.
    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Copy all counters into a plain snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections(),
            total_connections: self.total_connections(),
            bytes_to_target: self.bytes_to_target.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            udp_sessions: self.udp_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_to_target: u64,
    pub bytes_to_client: u64,
    pub dial_failures: u64,
    pub connection_errors: u64,
    pub rejected: u64,
    pub udp_sessions: u64,
}

/// Keeps one relay counted as active. Decrements on drop, so a relay task
/// that panics or is aborted still leaves the count correct.
#[derive(Debug)]
pub struct ActiveConnectionGuard {
    stats: Arc<ConnectionStats>,
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active() {
        let stats = Arc::new(ConnectionStats::new());

        let first = stats.open();
        let second = stats.open();
        assert_eq!(stats.active_connections(), 2);
        assert_eq!(stats.total_connections(), 2);

        drop(first);
        assert_eq!(stats.active_connections(), 1);
        drop(second);
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(stats.total_connections(), 2);
    }

    #[test]
    fn test_snapshot() {
        let stats = Arc::new(ConnectionStats::new());
        stats.add_to_target(100);
        stats.add_to_client(40);
        stats.dial_failure();
        stats.rejected();
        stats.set_udp_sessions(3);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_to_target, 100);
        assert_eq!(snap.bytes_to_client, 40);
        assert_eq!(snap.dial_failures, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.udp_sessions, 3);
        assert_eq!(snap.active_connections, 0);
    }
}
