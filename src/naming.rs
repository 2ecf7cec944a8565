//! Naming registry helpers
//!
//! Reach objects published by a remote naming service through tunnels. The
//! registry protocol itself is behind [`NamingRegistry`]; this module only
//! decides which tunnels to open.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::forwarding::{TunnelDirection, TunnelHandle, TunnelManager};
use crate::ssh::TunnelError;

/// `host:port` of a daemon
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub host: String,
    pub port: u16,
}

impl ObjectLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ObjectLocation {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::Config(format!("Location without port: {}", s)))?;
        if host.is_empty() {
            return Err(TunnelError::Config(format!("Location without host: {}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TunnelError::Config(format!("Invalid port in location: {}", s)))?;
        Ok(Self::new(host, port))
    }
}

/// `SCHEME:object@host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub scheme: String,
    pub object: String,
    pub location: ObjectLocation,
}

impl ObjectUri {
    pub fn new(scheme: impl Into<String>, object: impl Into<String>, location: ObjectLocation) -> Self {
        Self {
            scheme: scheme.into(),
            object: object.into(),
            location,
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.scheme, self.object, self.location)
    }
}

impl FromStr for ObjectUri {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| TunnelError::Config(format!("URI without scheme: {}", s)))?;
        let (object, location) = rest
            .rsplit_once('@')
            .ok_or_else(|| TunnelError::Config(format!("URI without location: {}", s)))?;
        if scheme.is_empty() || object.is_empty() {
            return Err(TunnelError::Config(format!("Malformed URI: {}", s)));
        }
        Ok(Self::new(scheme, object, location.parse()?))
    }
}

/// Operations needed from a naming service
#[async_trait]
pub trait NamingRegistry: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<ObjectUri, TunnelError>;

    async fn register(&self, name: &str, uri: &ObjectUri) -> Result<(), TunnelError>;
}

/// Where the naming service lives and how to reach it
#[derive(Debug, Clone)]
pub struct RegistryTunnelConfig {
    /// Gateway alias
    pub alias: String,
    pub relay_address: String,
    /// Naming service port on the gateway side
    pub registry_port: u16,
    /// Everything is reachable directly; open no tunnels
    pub local: bool,
}

impl RegistryTunnelConfig {
    pub fn new(alias: impl Into<String>, registry_port: u16) -> Self {
        Self {
            alias: alias.into(),
            relay_address: "localhost".into(),
            registry_port,
            local: false,
        }
    }

    pub fn with_relay_address(mut self, relay_address: impl Into<String>) -> Self {
        self.relay_address = relay_address.into();
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }
}

/// Tunnels to a remote naming service and the objects it publishes
pub struct RegistryTunnel {
    config: RegistryTunnelConfig,
    manager: Arc<TunnelManager>,
    registry: Arc<dyn NamingRegistry>,
    tunnels: parking_lot::Mutex<Vec<String>>,
}

impl RegistryTunnel {
    /// Tunnel to the naming service and wait until it answers.
    pub async fn connect(
        manager: Arc<TunnelManager>,
        registry: Arc<dyn NamingRegistry>,
        config: RegistryTunnelConfig,
    ) -> Result<Self, TunnelError> {
        let this = Self {
            config,
            manager,
            registry,
            tunnels: parking_lot::Mutex::new(Vec::new()),
        };

        if this.config.local {
            debug!("Naming service on {} used directly", this.config.registry_port);
            return Ok(this);
        }

        info!(
            "Locating naming service via {} on port {}",
            this.config.alias, this.config.registry_port
        );
        let handle = this
            .tunnel(
                this.config.registry_port,
                this.config.registry_port,
                TunnelDirection::Forward,
            )
            .await?;

        if !this.manager.probe(&handle).await {
            this.close().await;
            return Err(TunnelError::NotFound(format!(
                "naming service on {}:{} via {}",
                this.config.relay_address, this.config.registry_port, this.config.alias
            )));
        }
        Ok(this)
    }

    /// Look up `name` and tunnel to the daemon serving it.
    pub async fn remote_object(&self, name: &str) -> Result<ObjectUri, TunnelError> {
        let uri = self.registry.lookup(name).await?;
        if !self.config.local {
            let port = uri.location.port;
            self.tunnel(port, port, TunnelDirection::Forward).await?;
        }
        Ok(uri)
    }

    /// Tunnel straight to a daemon by URI, without the registry. The local
    /// port is the URI's port; `remote_port` defaults to it.
    pub async fn object_for_uri(
        &self,
        uri: &str,
        remote_port: Option<u16>,
        direction: TunnelDirection,
    ) -> Result<ObjectUri, TunnelError> {
        let uri: ObjectUri = uri.parse()?;
        if !self.config.local {
            let local_port = uri.location.port;
            self.tunnel(local_port, remote_port.unwrap_or(local_port), direction)
                .await?;
        }
        Ok(uri)
    }

    /// Let the remote side reach a daemon listening here, on the same port.
    pub async fn register_local_daemon(
        &self,
        location: &ObjectLocation,
    ) -> Result<Option<Arc<TunnelHandle>>, TunnelError> {
        if self.config.local {
            return Ok(None);
        }
        let handle = self
            .tunnel(location.port, location.port, TunnelDirection::Reverse)
            .await?;
        Ok(Some(handle))
    }

    /// Publish `uri` under `name`
    pub async fn register_object(&self, name: &str, uri: &ObjectUri) -> Result<(), TunnelError> {
        self.registry.register(name, uri).await
    }

    /// Ids of the tunnels opened by this helper
    pub fn tunnel_ids(&self) -> Vec<String> {
        self.tunnels.lock().clone()
    }

    /// Destroy every tunnel opened by this helper
    pub async fn close(&self) {
        let ids: Vec<String> = self.tunnels.lock().drain(..).collect();
        for id in ids {
            if let Err(e) = self.manager.destroy_tunnel(&id).await {
                warn!("Error destroying tunnel {}: {}", id, e);
            }
        }
    }

    /// Open a tunnel, reusing an open forward on the same port
    async fn tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
        direction: TunnelDirection,
    ) -> Result<Arc<TunnelHandle>, TunnelError> {
        if direction == TunnelDirection::Forward {
            if let Some(existing) = self
                .manager
                .find_open_forward(&self.config.relay_address, local_port)
            {
                if existing.remote_port() == remote_port {
                    debug!("Reusing tunnel {} for port {}", existing.id(), local_port);
                    return Ok(existing);
                }
            }
        }

        let handle = self
            .manager
            .create_tunnel(
                &self.config.alias,
                &self.config.relay_address,
                local_port,
                remote_port,
                direction,
            )
            .await?;
        self.tunnels.lock().push(handle.id().to_string());
        Ok(handle)
    }
}
