//! relaytunnel - SSH port-forward tunnels through an authenticated gateway
//!
//! Forward (-L) and reverse (-R) tunnels, each with its own session to the
//! gateway, managed by a [`TunnelManager`]. Gateways are named by alias and
//! resolved from a [`Configuration`].

pub mod config;
pub mod forwarding;
pub mod naming;
pub mod probe;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Configuration, EndpointResolver, HostKeyPolicy, TunnelOptions};
pub use forwarding::{TunnelDirection, TunnelHandle, TunnelManager, TunnelStatus};
pub use probe::RetryPolicy;
pub use ssh::{Endpoint, TunnelError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the default subscriber: `RUST_LOG` filter (default `info`) and the
/// fmt layer. Does nothing if one is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
