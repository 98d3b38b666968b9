//! Error types for forwarding instances and relays.

use std::io;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use super::instance::InstanceId;

/// Result type for lifecycle operations.
pub type ForwardResult<T> = Result<T, ForwardError>;

/// Instance-level errors, returned synchronously from lifecycle calls.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Malformed address, unsupported protocol or unusable settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unknown or destroyed instance.
    #[error("Instance {0} not found")]
    NotFound(InstanceId),

    /// Start on an instance that already has an active listener.
    #[error("Instance {0} is already running")]
    AlreadyRunning(InstanceId),

    /// Stop on an instance that is not running.
    #[error("Instance {0} is not running")]
    NotRunning(InstanceId),

    /// Destroy on an instance that has not been stopped.
    #[error("Instance {0} is still running")]
    StillRunning(InstanceId),

    /// The listen endpoint could not be acquired.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        /// Listen address from the rule.
        address: String,
        /// Underlying bind or resolve error.
        #[source]
        source: io::Error,
    },
}

/// Per-connection errors. These are logged and counted, never escalated.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Dialing the target failed.
    #[error("Failed to connect to {target}: {source}")]
    Dial {
        /// Target address from the rule.
        target: String,
        /// Underlying connect error.
        #[source]
        source: io::Error,
    },

    /// Dialing the target took longer than the connect timeout.
    #[error("Timed out connecting to {target}")]
    DialTimeout {
        /// Target address from the rule.
        target: String,
    },

    /// Client rejected because the instance is at its connection limit.
    #[error("Connection limit exceeded: {limit} connections")]
    ConnectionLimit {
        /// Configured limit.
        limit: usize,
    },

    /// Datagram dropped because the UDP session table is full.
    #[error("UDP session limit exceeded: {limit} sessions")]
    SessionLimit {
        /// Configured limit.
        limit: usize,
    },

    /// Read or write failure on an established relay.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The relay was force-closed after the drain period.
    #[error("Relay cancelled")]
    Cancelled,
}

impl RelayError {
    /// Whether the failure happened before any bytes could be relayed.
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, RelayError::Dial { .. } | RelayError::DialTimeout { .. })
    }
}

/// Single-slot holder for the most recent error text.
///
/// Overwritten on every new failure. A poisoned lock is recovered since the
/// slot only ever holds a complete `String`.
#[derive(Debug, Default)]
pub struct LastError(Mutex<Option<String>>);

impl LastError {
    /// Create an empty slot.
    pub const fn new() -> Self {
        Self(Mutex::new(None))
    }

    /// Replace the stored error.
    pub fn record(&self, err: impl std::fmt::Display) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(err.to_string());
    }

    /// Most recent error, if any.
    pub fn get(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
