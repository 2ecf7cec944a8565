//! SSH module - gateway sessions for tunnels
//!
//! This module provides the secure transport using the russh library.
//!
//! # Features
//! - Key authentication with default key discovery, password fallback
//! - Host key verification via known_hosts
//! - direct-tcpip channels (forward tunnels)
//! - tcpip-forward requests and inbound channel queue (reverse tunnels)

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod prompt;
mod transport;

pub use client::{ClientHandler, SshConnector};
pub use config::{current_username, Endpoint};
pub use error::TunnelError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{default_known_hosts_path, HostKeyVerification, KnownHostsStore};
pub use prompt::{NoPrompt, PasswordPrompt, TerminalPrompt};
pub use transport::{
    ChannelIo, InboundChannel, SecureTransport, SshTransport, TransportConnector, VirtualChannel,
};
