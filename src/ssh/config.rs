//! Gateway endpoint

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A concrete gateway to authenticate against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Private key to try first. `None` leaves the choice to the connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

pub(crate) fn default_port() -> u16 {
    22
}

/// Login name of the user running this process
pub fn current_username() -> String {
    whoami::username()
}

impl Endpoint {
    /// Endpoint for a literal address with defaulted port and user
    pub fn literal(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: current_username(),
            identity_file: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
