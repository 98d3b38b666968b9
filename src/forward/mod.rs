//! # Forwarding Engine
//!
//! The relay core: forwarding instances, their listener loops and the
//! per-connection relays they spawn.
//!
//! ## Lifecycle
//!
//! A [`ForwardingInstance`] is created `Stopped`. `start` binds the listen
//! endpoint and spawns a listener loop; `stop` closes the endpoint and gives
//! in-flight relays [`ForwardSettings::drain_timeout`] to finish before they
//! are closed. Per-connection failures (dial errors, resets) stay inside the
//! loop: they are counted and latched into the instance's last error, but the
//! instance keeps serving.
//!
//! ## Example
//!
//! ```no_run
//! use spf::forward::{ForwardSettings, ForwardingConfig, ForwardingInstance, InstanceId};
//!
//! # async fn run() -> Result<(), spf::forward::ForwardError> {
//! let config = ForwardingConfig::tcp("127.0.0.1:8080", "10.0.0.5:80");
//! config.validate()?;
//!
//! let instance = ForwardingInstance::new(InstanceId::from_raw(1), config, ForwardSettings::default());
//! let bound = instance.start().await?;
//! println!("forwarding {bound} -> 10.0.0.5:80");
//! instance.stop().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod instance;
mod relay;
mod session;
mod state;
mod stats;
mod tcp;
mod udp;

pub use config::{validate_endpoint, ForwardSettings, ForwardingConfig, Protocol};
pub use error::{ForwardError, ForwardResult, LastError, RelayError};
pub use instance::{ForwardingInstance, InstanceId, InstanceStatus};
pub use relay::{run_relay, RelayTotals};
pub use session::{SessionTable, UdpSession};
pub use state::InstanceState;
pub use stats::{ActiveConnectionGuard, ConnectionStats, StatsSnapshot};
