//! Configuration types for forwarding instances.

use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use super::error::{ForwardError, ForwardResult};

/// Transport protocol of a forwarding rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream forwarding: one relay per accepted connection.
    #[default]
    Tcp,
    /// Datagram forwarding: one pseudo-connection per client source address.
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ForwardError::InvalidConfig(format!(
                "unsupported protocol '{other}'"
            ))),
        }
    }
}

/// A single forwarding rule: listen endpoint, target endpoint and protocol.
///
/// Immutable once handed to the instance manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Optional rule name, used in logs and status reports.
    #[serde(default)]
    pub name: Option<String>,

    /// Listen endpoint (`host:port`, port may be 0).
    pub listen: String,

    /// Target endpoint (`host:port`).
    pub target: String,

    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

impl ForwardingConfig {
    /// Create a new forwarding rule.
    pub fn new(listen: impl Into<String>, target: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: None,
            listen: listen.into(),
            target: target.into(),
            protocol,
        }
    }

    /// Create a TCP forwarding rule.
    pub fn tcp(listen: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(listen, target, Protocol::Tcp)
    }

    /// Create a UDP forwarding rule.
    pub fn udp(listen: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(listen, target, Protocol::Udp)
    }

    /// Set the rule name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name for logging: the rule name, or the listen address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.listen)
    }

    /// Check that both endpoints are syntactically valid.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::InvalidConfig` describing the first bad field.
    pub fn validate(&self) -> ForwardResult<()> {
        validate_endpoint("listen", &self.listen, true)?;
        validate_endpoint("target", &self.target, false)?;
        Ok(())
    }
}

/// Engine tunables shared by every instance created with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardSettings {
    /// Timeout for dialing the target of an accepted TCP connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Grace period Stop grants in-flight relays before closing them.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Idle time after which a UDP pseudo-connection is torn down.
    #[serde(with = "humantime_serde")]
    pub udp_idle_timeout: Duration,

    /// Relay buffer size per TCP direction.
    pub buffer_size: usize,

    /// Largest datagram relayed over UDP.
    pub udp_buffer_size: usize,

    /// Maximum concurrent TCP connections per instance (0 = unlimited).
    pub max_connections: usize,

    /// Maximum concurrent UDP pseudo-connections per instance.
    pub max_udp_sessions: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_udp_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_buffer_size() -> usize {
    64 * 1024 // 64KB
}

fn default_udp_buffer_size() -> usize {
    65535 // Max UDP packet size
}

fn default_max_udp_sessions() -> usize {
    1024
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            drain_timeout: default_drain_timeout(),
            udp_idle_timeout: default_udp_idle_timeout(),
            buffer_size: default_buffer_size(),
            udp_buffer_size: default_udp_buffer_size(),
            max_connections: 0,
            max_udp_sessions: default_max_udp_sessions(),
        }
    }
}

impl ForwardSettings {
    /// Set the drain grace period.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the UDP idle timeout.
    #[must_use]
    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    /// Set the dial timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-instance TCP connection limit.
    #[must_use]
    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }

    /// Interval of the UDP idle sweeper.
    pub(crate) fn udp_sweep_interval(&self) -> Duration {
        (self.udp_idle_timeout / 10).max(Duration::from_millis(10))
    }

    /// Check the settings for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::InvalidConfig` for zero-sized buffers or timeouts.
    pub fn validate(&self) -> ForwardResult<()> {
        if self.buffer_size == 0 {
            return Err(ForwardError::InvalidConfig(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.udp_buffer_size == 0 {
            return Err(ForwardError::InvalidConfig(
                "udp_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ForwardError::InvalidConfig(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }
        if self.udp_idle_timeout.is_zero() {
            return Err(ForwardError::InvalidConfig(
                "udp_idle_timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_udp_sessions == 0 {
            return Err(ForwardError::InvalidConfig(
                "max_udp_sessions must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate a `host:port` endpoint.
///
/// Hosts may be IPv4 literals, bracketed IPv6 literals or DNS names.
///
/// # Errors
///
/// Returns `ForwardError::InvalidConfig` naming `field` when the value is malformed.
pub fn validate_endpoint(field: &str, value: &str, allow_zero_port: bool) -> ForwardResult<()> {
    let invalid = |reason: &str| {
        Err(ForwardError::InvalidConfig(format!(
            "invalid {field} address '{value}': {reason}"
        )))
    };

    let port = if let Ok(addr) = value.parse::<SocketAddr>() {
        addr.port()
    } else {
        let Some((host, port)) = value.rsplit_once(':') else {
            return invalid("expected host:port");
        };

        if let Some(inner) = host.strip_prefix('[') {
            let Some(inner) = inner.strip_suffix(']') else {
                return invalid("unterminated IPv6 bracket");
            };
            if inner.parse::<Ipv6Addr>().is_err() {
                return invalid("bad IPv6 literal");
            }
        } else if !is_valid_hostname(host) {
            return invalid("bad host");
        }

        match port.parse::<u16>() {
            Ok(port) => port,
            Err(_) => return invalid("bad port"),
        }
    };

    if port == 0 && !allow_zero_port {
        return invalid("port 0 is not allowed");
    }

    Ok(())
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
        assert_eq!(Protocol::Udp.to_string(), "udp");
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(" udp ".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(ForwardError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_valid_endpoints() {
        for value in [
            "127.0.0.1:8080",
            "0.0.0.0:0",
            "[::1]:53",
            "localhost:22",
            "db-1.internal.example.com:5432",
        ] {
            assert!(
                validate_endpoint("listen", value, true).is_ok(),
                "{value} should be valid"
            );
        }
    }

    #[test]
    fn test_invalid_endpoints() {
        for value in [
            "",
            "127.0.0.1",
            ":8080",
            "host:",
            "host:65536",
            "host:http",
            "::1:53",
            "[::1:53",
            "[nope]:53",
            "-bad.example:80",
            "two words:80",
        ] {
            assert!(
                validate_endpoint("target", value, true).is_err(),
                "{value} should be invalid"
            );
        }
    }

    #[test]
    fn test_zero_port_only_for_listen() {
        let config = ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:0");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("target"));

        let config = ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_display_name() {
        let config = ForwardingConfig::udp("0.0.0.0:53", "10.0.0.1:53");
        assert_eq!(config.display_name(), "0.0.0.0:53");
        assert_eq!(config.with_name("dns").display_name(), "dns");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ForwardSettings::default();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.drain_timeout, Duration::from_secs(5));
        assert_eq!(settings.udp_idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.buffer_size, 64 * 1024);
        assert_eq!(settings.max_connections, 0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = ForwardSettings::default();
        settings.buffer_size = 0;
        assert!(settings.validate().is_err());

        let settings = ForwardSettings::default().with_udp_idle_timeout(Duration::ZERO);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_sweep_interval_floor() {
        let settings = ForwardSettings::default().with_udp_idle_timeout(Duration::from_millis(20));
        assert_eq!(settings.udp_sweep_interval(), Duration::from_millis(10));

        let settings = ForwardSettings::default();
        assert_eq!(settings.udp_sweep_interval(), Duration::from_secs(6));
    }

    #[test]
    fn test_settings_deserialize_humantime() {
        let settings: ForwardSettings = serde_json::from_str(
            r#"{"connect_timeout": "2s", "drain_timeout": "250ms", "max_connections": 8}"#,
        )
        .unwrap();
        assert_eq!(settings.connect_timeout, Duration::from_secs(2));
        assert_eq!(settings.drain_timeout, Duration::from_millis(250));
        assert_eq!(settings.max_connections, 8);
        assert_eq!(settings.buffer_size, 64 * 1024);
    }
}
