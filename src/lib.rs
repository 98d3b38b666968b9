//! # spf
//!
//! A local port-forwarding engine. Each forwarding rule (listen endpoint,
//! target endpoint, TCP or UDP) becomes an independently controlled
//! forwarding instance that can be created, started, stopped and destroyed
//! at runtime.
//!
//! ## Features
//!
//! - TCP forwarding with one bidirectional relay per accepted connection
//! - UDP forwarding with per-client upstream sockets and idle eviction
//! - Graceful stop with a configurable drain period
//! - Per-instance connection and traffic counters
//! - TOML configuration and a C interface (`include/spf.h`)
//!
//! ## Architecture
//!
//! The [`manager::InstanceManager`] is the registry of
//! [`forward::ForwardingInstance`]s. Each running instance owns one listener
//! loop, which spawns a relay task per connection. Lifecycle errors are
//! returned as [`forward::ForwardError`]; per-connection errors stay inside the
//! instance and only show up in its status.
//!
//! ```no_run
//! use spf::forward::ForwardingConfig;
//! use spf::manager::InstanceManager;
//!
//! # async fn run() -> Result<(), spf::forward::ForwardError> {
//! let manager = InstanceManager::new();
//! let id = manager.create(ForwardingConfig::tcp("127.0.0.1:8080", "10.0.0.5:80"))?;
//! manager.start(id).await?;
//! assert!(manager.is_running(id)?);
//! manager.stop(id).await?;
//! manager.destroy(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ffi;
pub mod forward;
pub mod logging;
pub mod manager;
