//! # Configuration System
//!
//! TOML configuration for the `spf` binary and the `SPF_Create` entry point:
//! logging, engine tunables and a named set of forwarding rules.
//!
//! ## Example Configuration
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [engine]
//! connect_timeout = "10s"
//! drain_timeout = "5s"
//! udp_idle_timeout = "60s"
//!
//! [rules.web]
//! listen = "127.0.0.1:8080"
//! target = "10.0.0.5:80"
//!
//! [rules.dns]
//! listen = "0.0.0.0:5353"
//! target = "10.0.0.1:53"
//! protocol = "udp"
//! enabled = false
//! ```

mod error;
mod loader;
mod types;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use types::{LogFormat, LogLevel, LogOutput, LoggingConfig, RuleEntry, SpfConfig};
pub use validation::{
    BasicValidator, ListenConflictValidator, ValidationError, ValidationResult,
    ValidationSeverity, Validator,
};
