//! Configuration Module
//!
//! Alias table loading (JSON files, in-memory maps, `~/.ssh/config`) and
//! gateway endpoint resolution.

pub mod resolver;
pub mod ssh_config;
pub mod types;

pub use resolver::EndpointResolver;
pub use ssh_config::{default_ssh_config_path, parse_ssh_config, SshConfigHost};
pub use types::{
    default_identity_file, AliasEntry, ConfigError, Configuration, HostEntry, HostKeyPolicy,
    TunnelOptions,
};
