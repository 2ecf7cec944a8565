//! Tunnel error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// The requested local bind point is already in use.
    #[error("Will not be able to bind {address}:{port}: address already in use")]
    Conflict { address: String, port: u16 },

    /// The authenticated session to the gateway could not be established.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The gateway refused a single virtual channel request.
    #[error("Channel rejected: {0}")]
    ChannelRejected(String),

    /// Read/write failure on one proxied connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Pumps were still running when the grace period elapsed.
    #[error("{active} connection(s) still active after shutdown grace period")]
    ShutdownTimeout { active: u64 },

    #[error("Disconnected")]
    Disconnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl TunnelError {
    pub fn conflict(address: impl Into<String>, port: u16) -> Self {
        Self::Conflict {
            address: address.into(),
            port,
        }
    }

    /// Whether this failure is scoped to one proxied connection and must not
    /// take the tunnel down.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::ChannelRejected(_) | Self::Io(_))
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(err: russh::keys::Error) -> Self {
        TunnelError::Key(err.to_string())
    }
}
