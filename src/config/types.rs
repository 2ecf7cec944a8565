//! Configuration types
//!
//! The alias table and tunnel tuning knobs. A [`Configuration`] is built once
//! and handed to the resolver and the tunnel manager; there is no process-wide
//! instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use super::ssh_config::{default_ssh_config_path, parse_ssh_config, SshConfigHost};
use crate::probe::RetryPolicy;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid entry for alias {alias}: {message}")]
    InvalidEntry { alias: String, message: String },
}

/// Host alias fields, named as in an ssh config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(rename = "HostName", default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    #[serde(
        rename = "Port",
        default,
        deserialize_with = "deserialize_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,

    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(rename = "IdentityFile", default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

impl From<SshConfigHost> for HostEntry {
    fn from(host: SshConfigHost) -> Self {
        Self {
            host_name: host.hostname,
            port: host.port,
            user: host.user,
            identity_file: host.identity_file,
        }
    }
}

/// One alias table value.
///
/// Accepts an object (`{"HostName": .., "Port": .., "User": .., "IdentityFile": ..}`),
/// the legacy `[hostname, username, port]` list, or an empty list meaning
/// "use the alias itself as the address".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AliasEntry {
    // List variants come first: derived struct impls also accept sequences.
    Legacy(String, String, #[serde(deserialize_with = "deserialize_legacy_port")] u16),
    Literal(Vec<serde_json::Value>),
    Host(HostEntry),
}

impl AliasEntry {
    fn validate(&self, alias: &str) -> Result<(), ConfigError> {
        match self {
            AliasEntry::Literal(values) if !values.is_empty() => Err(ConfigError::InvalidEntry {
                alias: alias.to_string(),
                message: format!(
                    "expected an object, an empty list or [hostname, username, port], got a list of {}",
                    values.len()
                ),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    fn into_port<E: serde::de::Error>(self) -> Result<u16, E> {
        match self {
            PortValue::Number(n) => Ok(n),
            PortValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid port {:?}", s))),
        }
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<PortValue>::deserialize(deserializer)? {
        Some(value) => value.into_port().map(Some),
        None => Ok(None),
    }
}

fn deserialize_legacy_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    PortValue::deserialize(deserializer)?.into_port()
}

/// How unknown or changed gateway host keys are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Reject hosts missing from known_hosts
    Strict,
    /// Accept unknown hosts and record them in known_hosts
    AcceptNew,
    /// Accept unknown hosts with a warning, record nothing
    #[default]
    Warn,
}

/// Timing knobs for relays and transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// How often the reverse accept loop re-checks its stop flag
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_interval_ms: u64,

    /// Wait for in-flight pumps on stop before force-closing them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Close a proxied connection after this long without traffic
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Gateway connect + handshake timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Address the gateway binds for reverse tunnels.
    ///
    /// Defaults to `localhost`, so only processes on the gateway itself can
    /// reach a reverse tunnel. This is narrower than a bare `ssh -R port:...`
    /// request. Set it to `""` to ask the gateway to listen on all of its
    /// interfaces (still subject to its `GatewayPorts` setting).
    #[serde(default = "default_remote_bind_address")]
    pub remote_bind_address: String,

    /// Retry policy used to confirm a forwarded service came up
    #[serde(default)]
    pub probe: RetryPolicy,
}

fn default_accept_poll_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_remote_bind_address() -> String {
    "localhost".to_string()
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            accept_poll_interval_ms: default_accept_poll_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            remote_bind_address: default_remote_bind_address(),
            probe: RetryPolicy::default(),
        }
    }
}

impl TunnelOptions {
    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Default private key used when an alias names none
pub fn default_identity_file() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_rsa"))
        .unwrap_or_else(|| PathBuf::from(".ssh/id_rsa"))
}

/// Tunnel engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Alias name -> endpoint fields
    #[serde(default)]
    pub hosts: HashMap<String, AliasEntry>,

    #[serde(default = "default_identity_file")]
    pub default_identity_file: PathBuf,

    /// Prompt for a password when no key authenticates.
    /// Blocks the creating task until the user answers.
    #[serde(default)]
    pub allow_password_prompt: bool,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Overrides `~/.ssh/known_hosts`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default)]
    pub options: TunnelOptions,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            hosts: HashMap::new(),
            default_identity_file: default_identity_file(),
            allow_password_prompt: false,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            options: TunnelOptions::default(),
        }
    }
}

impl Configuration {
    /// Empty alias table, default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the alias table from `~/.ssh/config`. A missing file (or home
    /// directory) is not an error.
    pub fn with_ssh_defaults() -> Self {
        let mut config = Self::new();
        match default_ssh_config_path() {
            Ok(path) => {
                if let Err(e) = config.seed_from_ssh_config(&path) {
                    debug!("Ignoring ssh config {}: {}", path.display(), e);
                }
            }
            Err(e) => debug!("No default ssh config: {}", e),
        }
        config
    }

    /// Merge `Host` blocks from an ssh config file into the alias table
    pub fn seed_from_ssh_config(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let hosts = parse_ssh_config(path)?;
        let count = hosts.len();
        for host in hosts {
            let alias = host.alias.clone();
            self.hosts.insert(alias, AliasEntry::Host(host.into()));
        }
        debug!("Seeded {} aliases from {}", count, path.display());
        Ok(count)
    }

    /// Merge a JSON alias file (object of alias -> entry) into the table
    pub fn load_json_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let count = self.load_json_str(&content)?;
        info!("Loaded {} aliases from {}", count, path.display());
        Ok(count)
    }

    /// Merge a JSON alias document into the table
    pub fn load_json_str(&mut self, content: &str) -> Result<usize, ConfigError> {
        let hosts: HashMap<String, AliasEntry> = serde_json::from_str(content)?;
        self.merge_hosts(hosts)
    }

    /// Merge an in-memory alias map. Existing aliases are overwritten,
    /// others are kept. Nothing is merged if any entry is invalid.
    pub fn merge_hosts(&mut self, hosts: HashMap<String, AliasEntry>) -> Result<usize, ConfigError> {
        for (alias, entry) in &hosts {
            entry.validate(alias)?;
        }
        let count = hosts.len();
        self.hosts.extend(hosts);
        Ok(count)
    }

    pub fn insert_host(&mut self, alias: impl Into<String>, entry: HostEntry) {
        self.hosts.insert(alias.into(), AliasEntry::Host(entry));
    }

    pub fn host(&self, alias: &str) -> Option<&AliasEntry> {
        self.hosts.get(alias)
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }
}
