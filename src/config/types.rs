//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::forward::{ForwardSettings, ForwardingConfig, Protocol};

/// Root of an `spf` configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpfConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Engine tunables applied to every rule.
    pub engine: ForwardSettings,

    /// Forwarding rules keyed by name.
    pub rules: BTreeMap<String, RuleEntry>,
}

impl SpfConfig {
    /// Enabled rules in name order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = (&String, &RuleEntry)> {
        self.rules.iter().filter(|(_, rule)| rule.enabled)
    }

    /// Forwarding configs for every enabled rule, named after their table key.
    pub fn forwarding_configs(&self) -> Vec<ForwardingConfig> {
        self.enabled_rules()
            .map(|(name, rule)| rule.to_forwarding_config(name))
            .collect()
    }
}

/// A forwarding rule as written in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    /// Listen endpoint (`host:port`).
    pub listen: String,

    /// Target endpoint (`host:port`).
    pub target: String,

    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,

    /// Disabled rules are parsed and validated but never started.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RuleEntry {
    /// Create an enabled rule.
    pub fn new(listen: impl Into<String>, target: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            listen: listen.into(),
            target: target.into(),
            protocol,
            enabled: true,
        }
    }

    /// Set the enabled state.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Convert into the engine's rule type.
    pub fn to_forwarding_config(&self, name: &str) -> ForwardingConfig {
        ForwardingConfig::new(self.listen.clone(), self.target.clone(), self.protocol)
            .with_name(name)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: LogLevel,

    /// Log format (json, pretty, compact).
    pub format: LogFormat,

    /// Output destination.
    pub output: LogOutput,

    /// Log file path (when output is "file").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            output: LogOutput::Stderr,
            file_path: None,
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level (default).
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level (least verbose).
    Error,
}

impl LogLevel {
    /// The level `steps` notches more verbose, saturating at `Trace`.
    #[must_use]
    pub fn more_verbose(self, steps: u8) -> Self {
        const ORDER: [LogLevel; 5] = [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ];
        let current = ORDER.iter().position(|l| *l == self).unwrap_or(2);
        ORDER[(current + usize::from(steps)).min(ORDER.len() - 1)]
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable).
    Json,
    /// Pretty multi-line format (default).
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
}

/// Log output destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output.
    Stdout,
    /// Standard error (default).
    #[default]
    Stderr,
    /// File output, appended to `file_path`.
    File,
}
