//! Forwarding instance lifecycle states.

use serde::Serialize;

/// Lifecycle state of a forwarding instance.
///
/// ```text
/// Stopped -> Starting -> Running -> Stopping -> Stopped
///               |
///               +-> Stopped (bind failure)
/// ```
///
/// No socket is open while `Stopped`. Exactly one listener loop is active
/// while `Running` or `Stopping`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Initial state, and the only one from which an instance can be destroyed.
    #[default]
    Stopped,

    /// Binding the listen endpoint.
    Starting,

    /// Listener loop accepting connections.
    Running,

    /// Listener loop shutting down.
    Stopping,
}

impl InstanceState {
    /// Returns `true` while a listener loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Returns `true` if the instance is stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(InstanceState::Stopped.to_string(), "stopped");
        assert_eq!(InstanceState::Starting.to_string(), "starting");
        assert_eq!(InstanceState::Running.to_string(), "running");
        assert_eq!(InstanceState::Stopping.to_string(), "stopping");
    }

    #[test]
    fn test_state_predicates() {
        assert!(InstanceState::default().is_stopped());
        assert!(!InstanceState::Starting.is_running());
        assert!(InstanceState::Running.is_running());
        assert!(InstanceState::Stopping.is_running());
    }

    #[test]
    fn test_state_serialize() {
        let json = serde_json::to_string(&InstanceState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
