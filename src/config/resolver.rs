//! Endpoint resolution
//!
//! Maps a gateway alias to a concrete [`Endpoint`]. Unknown names are used as
//! literal addresses, the way an ssh client treats a host it has no config
//! block for.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use super::ssh_config::expand_tilde;
use super::types::{AliasEntry, Configuration};
use crate::ssh::{current_username, Endpoint};

#[derive(Debug, Clone)]
pub struct EndpointResolver {
    hosts: HashMap<String, AliasEntry>,
    default_identity_file: PathBuf,
}

impl EndpointResolver {
    pub fn new(config: &Configuration) -> Self {
        Self {
            hosts: config.hosts.clone(),
            default_identity_file: config.default_identity_file.clone(),
        }
    }

    /// Resolve `name` to an endpoint. Never fails.
    pub fn resolve(&self, name: &str) -> Endpoint {
        let Some(entry) = self.hosts.get(name) else {
            debug!("No alias for {}, using it as a literal address", name);
            return Endpoint::literal(name);
        };

        let endpoint = match entry {
            AliasEntry::Host(host) => Endpoint {
                host: host.host_name.clone().unwrap_or_else(|| name.to_string()),
                port: host.port.unwrap_or(22),
                username: host.user.clone().unwrap_or_else(current_username),
                identity_file: Some(
                    host.identity_file
                        .as_deref()
                        .map(|path| PathBuf::from(expand_tilde(path)))
                        .unwrap_or_else(|| self.default_identity_file.clone()),
                ),
            },
            AliasEntry::Legacy(host, user, port) => Endpoint {
                host: host.clone(),
                port: *port,
                username: user.clone(),
                identity_file: Some(self.default_identity_file.clone()),
            },
            AliasEntry::Literal(_) => {
                Endpoint::literal(name).with_identity_file(self.default_identity_file.clone())
            }
        };

        debug!("Resolved alias {} to {}", name, endpoint);
        endpoint
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.contains_key(name)
    }
}
