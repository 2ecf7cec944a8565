//! Tunnel Module
//!
//! Forward (-L) and reverse (-R) relays over a secure transport, and the
//! manager that owns them.

mod bridge;
pub mod local;
pub mod manager;
pub mod remote;

pub use bridge::{ForwardStats, ForwardStatsAtomic};
pub use local::{check_port_available, resolve_bind_addr, ForwardRelay, ForwardState, LocalForward};
pub use manager::{TunnelDirection, TunnelHandle, TunnelInfo, TunnelManager, TunnelStatus};
pub use remote::{RemoteForward, ReverseRelay, ReverseState};
