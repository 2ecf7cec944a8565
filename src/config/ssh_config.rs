//! SSH Config Parser
//!
//! Reads `~/.ssh/config` to seed the alias table with the user's existing
//! hosts. Only the directives a tunnel endpoint needs are kept:
//! `Host`, `HostName`, `User`, `Port`, `IdentityFile`.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::ConfigError;

/// A parsed SSH config host entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SshConfigHost {
    /// Host alias (the pattern after "Host")
    pub alias: String,
    /// Actual hostname (HostName directive)
    pub hostname: Option<String>,
    /// Username (User directive)
    pub user: Option<String>,
    /// Port number (Port directive)
    pub port: Option<u16>,
    /// Identity file path (IdentityFile directive), `~` expanded
    pub identity_file: Option<String>,
}

impl SshConfigHost {
    /// Get the effective hostname (hostname or alias)
    pub fn effective_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.alias)
    }

    /// Get effective port (port or 22)
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    /// Check if this is a wildcard pattern
    pub fn is_wildcard(&self) -> bool {
        self.alias.contains('*') || self.alias.contains('?')
    }
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Parse an SSH config file. A missing file yields no hosts.
pub fn parse_ssh_config(path: &Path) -> Result<Vec<SshConfigHost>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No ssh config found at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    Ok(parse_ssh_config_content(&content))
}

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(value: &str) -> String {
    if let Some(stripped) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    }
    value.to_string()
}

/// Parse SSH config content string
pub fn parse_ssh_config_content(content: &str) -> Vec<SshConfigHost> {
    let mut hosts = Vec::new();
    let mut current_host: Option<SshConfigHost> = None;

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // "Key Value" or "Key=Value"
        let (key, value) = if let Some(eq_pos) = line.find('=') {
            (line[..eq_pos].trim(), line[eq_pos + 1..].trim())
        } else {
            let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
            if parts.len() < 2 {
                continue;
            }
            (parts[0], parts[1].trim())
        };

        let key_lower = key.to_lowercase();

        if key_lower == "host" {
            if let Some(host) = current_host.take() {
                if !host.is_wildcard() {
                    hosts.push(host);
                }
            }

            // "Host foo bar": the first non-wildcard alias wins
            current_host = value
                .split_whitespace()
                .find(|alias| !alias.contains('*') && !alias.contains('?'))
                .map(|alias| SshConfigHost {
                    alias: alias.to_string(),
                    ..Default::default()
                });
        } else if let Some(ref mut host) = current_host {
            match key_lower.as_str() {
                "hostname" => host.hostname = Some(value.to_string()),
                "user" => host.user = Some(value.to_string()),
                "port" => host.port = value.parse().ok(),
                "identityfile" => host.identity_file = Some(expand_tilde(value)),
                _ => {}
            }
        }
    }

    if let Some(host) = current_host {
        if !host.is_wildcard() {
            hosts.push(host);
        }
    }

    hosts
}
