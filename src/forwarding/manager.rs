//! Tunnel Manager
//!
//! Owns every tunnel created in this process. Each tunnel gets its own
//! transport to its gateway and one relay on top of it; the registry here is
//! the only state shared between callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bridge::ForwardStats;
use super::local::{check_port_available, ForwardRelay, LocalForward};
use super::remote::{RemoteForward, ReverseRelay};
use crate::config::{Configuration, EndpointResolver, TunnelOptions};
use crate::probe::{probe, probe_tcp};
use crate::ssh::{Endpoint, SecureTransport, SshConnector, TransportConnector, TunnelError};

/// Which way connections travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelDirection {
    /// Local listener, connections carried to the gateway side (-L)
    Forward,
    /// Gateway listener, connections carried back here (-R)
    Reverse,
}

/// Open until destroyed, never reopened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Open,
    Closed,
}

enum TunnelRelay {
    Forward(ForwardRelay),
    Reverse(ReverseRelay),
}

impl TunnelRelay {
    async fn stop(&self) {
        match self {
            TunnelRelay::Forward(relay) => relay.stop().await,
            TunnelRelay::Reverse(relay) => relay.stop().await,
        }
    }

    fn stats(&self) -> ForwardStats {
        match self {
            TunnelRelay::Forward(relay) => relay.stats(),
            TunnelRelay::Reverse(relay) => relay.stats(),
        }
    }
}

/// Serializable snapshot of a tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub direction: TunnelDirection,
    pub relay_address: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub gateway: String,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub stats: ForwardStats,
}

/// One tunnel: its transport and the relay running on it
pub struct TunnelHandle {
    id: String,
    direction: TunnelDirection,
    relay_address: String,
    local_port: u16,
    remote_port: u16,
    endpoint: Endpoint,
    created_at: DateTime<Utc>,
    open: AtomicBool,
    /// Set by the first shutdown; later calls return immediately
    closing: AtomicBool,
    transport: Arc<dyn SecureTransport>,
    relay: TunnelRelay,
}

impl TunnelHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> TunnelDirection {
        self.direction
    }

    pub fn relay_address(&self) -> &str {
        &self.relay_address
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Gateway this tunnel runs through
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TunnelStatus {
        if self.open.load(Ordering::SeqCst) {
            TunnelStatus::Open
        } else {
            TunnelStatus::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.status() == TunnelStatus::Open
    }

    pub fn stats(&self) -> ForwardStats {
        self.relay.stats()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            direction: self.direction,
            relay_address: self.relay_address.clone(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            gateway: self.endpoint.to_string(),
            status: self.status(),
            created_at: self.created_at,
            stats: self.stats(),
        }
    }

    /// Stop the relay, then close the transport. Only the first call acts.
    async fn shutdown(&self) -> Result<(), TunnelError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("Tunnel {} already closing", self.id);
            return Ok(());
        }

        info!("Destroying tunnel {}", self.id);
        self.relay.stop().await;
        let result = self.transport.close().await;
        self.open.store(false, Ordering::SeqCst);
        result
    }
}

pub struct TunnelManager {
    resolver: EndpointResolver,
    connector: Arc<dyn TransportConnector>,
    options: TunnelOptions,
    /// id -> handle. Destroyed handles stay as Closed until pruned.
    tunnels: parking_lot::Mutex<HashMap<String, Arc<TunnelHandle>>>,
}

impl TunnelManager {
    /// Manager connecting to gateways over SSH
    pub fn new(config: Configuration) -> Self {
        let connector = Arc::new(SshConnector::new(&config));
        Self::with_connector(&config, connector)
    }

    pub fn with_connector(config: &Configuration, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            resolver: EndpointResolver::new(config),
            connector,
            options: config.options.clone(),
            tunnels: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    /// Create and register a tunnel through the gateway named by `alias`.
    ///
    /// Forward: listen on `relay_address:local_port`, carry connections to
    /// `relay_address:remote_port` as seen from the gateway.
    /// Reverse: the gateway listens on `local_port`, connections are carried
    /// to `relay_address:remote_port` here.
    ///
    /// Nothing is registered when this fails.
    pub async fn create_tunnel(
        &self,
        alias: &str,
        relay_address: &str,
        local_port: u16,
        remote_port: u16,
        direction: TunnelDirection,
    ) -> Result<Arc<TunnelHandle>, TunnelError> {
        let endpoint = self.resolver.resolve(alias);

        if direction == TunnelDirection::Forward {
            if let Some(existing) = self.find_open_forward(relay_address, local_port) {
                warn!(
                    "{}:{} is already forwarded by tunnel {}",
                    relay_address,
                    local_port,
                    existing.id()
                );
                return Err(TunnelError::conflict(relay_address, local_port));
            }
            check_port_available(relay_address, local_port).await?;
        }

        let transport = self.connector.connect(&endpoint).await?;

        let relay = match self
            .start_relay(transport.clone(), relay_address, local_port, remote_port, direction)
            .await
        {
            Ok(relay) => relay,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    warn!("Failed to close transport to {}: {}", endpoint, close_err);
                }
                return Err(e);
            }
        };

        let handle = Arc::new(TunnelHandle {
            id: Uuid::new_v4().to_string(),
            direction,
            relay_address: relay_address.to_string(),
            local_port,
            remote_port,
            endpoint,
            created_at: Utc::now(),
            open: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            transport,
            relay,
        });

        self.tunnels
            .lock()
            .insert(handle.id.clone(), handle.clone());

        info!(
            "Tunnel {} open: {:?} {}:{} <-> {} via {}",
            handle.id, direction, relay_address, local_port, remote_port, handle.endpoint
        );
        Ok(handle)
    }

    async fn start_relay(
        &self,
        transport: Arc<dyn SecureTransport>,
        relay_address: &str,
        local_port: u16,
        remote_port: u16,
        direction: TunnelDirection,
    ) -> Result<TunnelRelay, TunnelError> {
        match direction {
            TunnelDirection::Forward => {
                let config = LocalForward::new(relay_address, local_port, relay_address, remote_port);
                let mut relay = ForwardRelay::new(config, transport, &self.options);
                relay.start().await?;
                Ok(TunnelRelay::Forward(relay))
            }
            TunnelDirection::Reverse => {
                let config = RemoteForward::new(
                    self.options.remote_bind_address.clone(),
                    local_port,
                    relay_address,
                    remote_port,
                );
                let mut relay = ReverseRelay::new(config, transport, &self.options);
                relay.start().await?;
                Ok(TunnelRelay::Reverse(relay))
            }
        }
    }

    /// Stop and close a tunnel. Unknown or already closed ids are a no-op.
    pub async fn destroy_tunnel(&self, id: &str) -> Result<(), TunnelError> {
        let handle = self.tunnels.lock().get(id).cloned();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => {
                debug!("destroy_tunnel: no tunnel {}", id);
                Ok(())
            }
        }
    }

    /// Destroy every tunnel. Failures are logged and do not stop the others.
    pub async fn cleanup(&self) {
        let handles: Vec<Arc<TunnelHandle>> = self.tunnels.lock().values().cloned().collect();
        if handles.is_empty() {
            return;
        }

        info!("Cleaning up {} tunnel(s)", handles.len());
        let results = join_all(handles.iter().map(|handle| handle.shutdown())).await;

        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                warn!("Error destroying tunnel {}: {}", handle.id(), e);
            }
        }
    }

    /// id -> open
    pub fn tunnel_status(&self) -> HashMap<String, bool> {
        self.tunnels
            .lock()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.is_open()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<TunnelHandle>> {
        self.tunnels.lock().get(id).cloned()
    }

    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        let handles: Vec<Arc<TunnelHandle>> = self.tunnels.lock().values().cloned().collect();
        handles.iter().map(|handle| handle.info()).collect()
    }

    /// Open forward tunnel already listening on `relay_address:local_port`
    pub fn find_open_forward(&self, relay_address: &str, local_port: u16) -> Option<Arc<TunnelHandle>> {
        self.tunnels
            .lock()
            .values()
            .find(|handle| {
                handle.direction == TunnelDirection::Forward
                    && handle.is_open()
                    && handle.local_port == local_port
                    && handle.relay_address == relay_address
            })
            .cloned()
    }

    /// Drop closed tunnels from the registry. Returns how many were removed.
    pub fn prune_closed(&self) -> usize {
        let mut tunnels = self.tunnels.lock();
        let before = tunnels.len();
        tunnels.retain(|_, handle| handle.is_open());
        before - tunnels.len()
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.lock().is_empty()
    }

    /// Wait until the service behind a tunnel accepts connections, using the
    /// configured retry policy. Forward tunnels are checked by opening a
    /// channel to the target through the gateway, since the local listener
    /// always accepts.
    pub async fn probe(&self, handle: &TunnelHandle) -> bool {
        match handle.direction {
            TunnelDirection::Forward => {
                let transport = &handle.transport;
                let host = handle.relay_address.as_str();
                let port = handle.remote_port;
                probe(&self.options.probe, || async move {
                    transport.open_channel(host, port).await.map(|_channel| ())
                })
                .await
            }
            TunnelDirection::Reverse => {
                probe_tcp(&handle.relay_address, handle.remote_port, &self.options.probe).await
            }
        }
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        let open: Vec<Arc<TunnelHandle>> = self
            .tunnels
            .get_mut()
            .drain()
            .map(|(_, handle)| handle)
            .filter(|handle| handle.is_open())
            .collect();
        if open.is_empty() {
            return;
        }

        warn!(
            "TunnelManager dropped with {} open tunnel(s); call cleanup() first",
            open.len()
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for handle in open {
                        if let Err(e) = handle.shutdown().await {
                            warn!("Error destroying tunnel {}: {}", handle.id(), e);
                        }
                    }
                });
            }
            Err(_) => warn!("No runtime to tear down the remaining tunnels"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostEntry;
    use crate::probe::RetryPolicy;
    use crate::testing::{free_port, spawn_echo_server, spawn_echo_server_on, LoopbackConnector};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config() -> Configuration {
        let mut config = Configuration::new();
        config.insert_host(
            "gw",
            HostEntry {
                host_name: Some("127.0.0.1".into()),
                port: Some(2222),
                user: Some("tunnel".into()),
                identity_file: None,
            },
        );
        config.options = TunnelOptions {
            accept_poll_interval_ms: 50,
            shutdown_grace_ms: 300,
            remote_bind_address: "127.0.0.1".into(),
            probe: RetryPolicy::new(5, Duration::from_millis(20)),
            ..TunnelOptions::default()
        };
        config
    }

    fn manager() -> (TunnelManager, Arc<LoopbackConnector>) {
        let connector = LoopbackConnector::new();
        let manager = TunnelManager::with_connector(&config(), connector.clone());
        (manager, connector)
    }

    async fn echo_roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut read, mut write) = stream.into_split();

        let to_send = payload.to_vec();
        let writer = tokio::spawn(async move {
            write.write_all(&to_send).await.unwrap();
            write
        });

        let mut received = vec![0u8; payload.len()];
        read.read_exact(&mut received).await.unwrap();
        let _write = writer.await.unwrap();
        received
    }

    #[tokio::test]
    async fn test_create_resolves_alias() {
        let (manager, connector) = manager();
        let echo_port = spawn_echo_server().await;
        let local_port = free_port().await;

        let handle = manager
            .create_tunnel("gw", "127.0.0.1", local_port, echo_port, TunnelDirection::Forward)
            .await
            .unwrap();

        let endpoints = connector.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].host, "127.0.0.1");
        assert_eq!(endpoints[0].port, 2222);
        assert_eq!(endpoints[0].username, "tunnel");
        assert_eq!(handle.status(), TunnelStatus::Open);
        assert_eq!(manager.tunnel_status().get(handle.id()), Some(&true));

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_conflict_with_open_tunnel() {
        let (manager, connector) = manager();
        let echo_port = spawn_echo_server().await;
        let local_port = free_port().await;

        manager
            .create_tunnel("gw", "127.0.0.1", local_port, echo_port, TunnelDirection::Forward)
            .await
            .unwrap();
        assert_eq!(manager.len(), 1);

        let second = manager
            .create_tunnel("gw", "127.0.0.1", local_port, echo_port, TunnelDirection::Forward)
            .await;
        assert!(matches!(second, Err(TunnelError::Conflict { .. })));
        assert_eq!(manager.len(), 1);
        // No transport was opened for the rejected request
        assert_eq!(connector.transports().len(), 1);

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_conflict_with_foreign_listener() {
        let (manager, connector) = manager();
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let result = manager
            .create_tunnel("gw", "127.0.0.1", port, 1, TunnelDirection::Forward)
            .await;
        match result {
            Err(TunnelError::Conflict { address, port: p }) => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(p, port);
            }
            Err(other) => panic!("expected Conflict, got {}", other),
            Ok(_) => panic!("bound an occupied port"),
        }
        assert!(manager.is_empty());
        assert!(connector.transports().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_registers_nothing() {
        let (manager, connector) = manager();
        connector.set_fail_auth(true);
        let local_port = free_port().await;

        let result = manager
            .create_tunnel("gw", "127.0.0.1", local_port, 1, TunnelDirection::Forward)
            .await;
        assert!(matches!(result, Err(TunnelError::Auth(_))));
        assert!(manager.is_empty());

        // The port was never bound
        check_port_available("127.0.0.1", local_port).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_byte_exact() {
        let (manager, _) = manager();
        let echo_port = spawn_echo_server().await;
        let local_port = free_port().await;
        manager
            .create_tunnel("gw", "127.0.0.1", local_port, echo_port, TunnelDirection::Forward)
            .await
            .unwrap();

        // Empty payload: nothing comes back
        let mut empty = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        empty.shutdown().await.unwrap();
        let mut buf = Vec::new();
        empty.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        let small = b"hello through the tunnel".to_vec();
        assert_eq!(echo_roundtrip(local_port, &small).await, small);

        // Larger than any single read, with every byte value
        let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(echo_roundtrip(local_port, &large).await, large);

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_reverse_byte_exact() {
        let (manager, connector) = manager();
        let echo_port = spawn_echo_server().await;
        let gateway_port = free_port().await;

        let handle = manager
            .create_tunnel("gw", "127.0.0.1", gateway_port, echo_port, TunnelDirection::Reverse)
            .await
            .unwrap();
        assert_eq!(handle.direction(), TunnelDirection::Reverse);

        let large: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(echo_roundtrip(gateway_port, &large).await, large);
        assert_eq!(echo_roundtrip(gateway_port, b"pong").await, b"pong");

        manager.destroy_tunnel(handle.id()).await.unwrap();
        let transport = &connector.transports()[0];
        assert!(!transport.has_remote_forward(gateway_port));
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (manager, connector) = manager();
        let local_port = free_port().await;
        let handle = manager
            .create_tunnel("gw", "127.0.0.1", local_port, 1, TunnelDirection::Forward)
            .await
            .unwrap();
        let id = handle.id().to_string();

        manager.destroy_tunnel(&id).await.unwrap();
        let after_first = manager.tunnel_status();
        assert_eq!(after_first.get(&id), Some(&false));

        manager.destroy_tunnel(&id).await.unwrap();
        manager.destroy_tunnel("no-such-tunnel").await.unwrap();
        assert_eq!(manager.tunnel_status(), after_first);
        assert_eq!(connector.transports()[0].close_calls(), 1);
        assert_eq!(handle.status(), TunnelStatus::Closed);
    }

    #[tokio::test]
    async fn test_port_reusable_after_destroy() {
        let (manager, _) = manager();
        let echo_port = spawn_echo_server().await;
        let local_port = free_port().await;

        let first = manager
            .create_tunnel("gw", "127.0.0.1", local_port, echo_port, TunnelDirection::Forward)
            .await
            .unwrap();
        assert_eq!(echo_roundtrip(local_port, b"one").await, b"one");
        manager.destroy_tunnel(first.id()).await.unwrap();

        let second = manager
            .create_tunnel("gw", "127.0.0.1", local_port, echo_port, TunnelDirection::Forward)
            .await
            .unwrap();
        assert_eq!(echo_roundtrip(local_port, b"two").await, b"two");
        assert_ne!(first.id(), second.id());

        assert_eq!(manager.prune_closed(), 1);
        assert_eq!(manager.len(), 1);
        manager.cleanup().await;
    }

    /// Echoes, except a connection whose first byte is `x` is dropped at once
    async fn spawn_flaky_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut first = [0u8; 1];
                    if stream.read_exact(&mut first).await.is_err() || first[0] == b'x' {
                        return;
                    }
                    let (mut read, mut write) = stream.split();
                    write.write_all(&first).await.unwrap();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_connection_error_is_isolated() {
        let (manager, _) = manager();
        let target_port = spawn_flaky_server().await;
        let local_port = free_port().await;
        let handle = manager
            .create_tunnel("gw", "127.0.0.1", local_port, target_port, TunnelDirection::Forward)
            .await
            .unwrap();

        let mut sibling = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        sibling.write_all(b"a1").await.unwrap();
        let mut buf = [0u8; 2];
        sibling.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a1");

        // Target drops this one abruptly
        let mut victim = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        victim.write_all(b"x").await.unwrap();
        let mut rest = Vec::new();
        let _ = victim.read_to_end(&mut rest).await;
        assert!(rest.is_empty());

        sibling.write_all(b"b2").await.unwrap();
        sibling.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b2");

        assert_eq!(manager.tunnel_status().get(handle.id()), Some(&true));
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_closes_everything() {
        let (manager, connector) = manager();
        let echo_port = spawn_echo_server().await;

        for _ in 0..2 {
            let port = free_port().await;
            manager
                .create_tunnel("gw", "127.0.0.1", port, echo_port, TunnelDirection::Forward)
                .await
                .unwrap();
        }
        let reverse_port = free_port().await;
        manager
            .create_tunnel("gw", "127.0.0.1", reverse_port, echo_port, TunnelDirection::Reverse)
            .await
            .unwrap();

        manager.cleanup().await;
        assert_eq!(manager.len(), 3);
        assert!(manager.tunnel_status().values().all(|open| !open));
        for transport in connector.transports() {
            assert_eq!(transport.close_calls(), 1);
            assert!(!transport.is_connected());
        }

        // Second cleanup is harmless
        manager.cleanup().await;
        assert_eq!(manager.prune_closed(), 3);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_drop_tears_down_open_tunnels() {
        let (manager, connector) = manager();
        let echo_port = spawn_echo_server().await;
        let port = free_port().await;
        let handle = manager
            .create_tunnel("gw", "127.0.0.1", port, echo_port, TunnelDirection::Forward)
            .await
            .unwrap();

        drop(manager);

        let transport = connector.transports()[0].clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.close_calls() == 0 || handle.is_open() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("tunnel torn down after drop");
        assert!(check_port_available("127.0.0.1", port).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_forward() {
        let (manager, _) = manager();
        let echo_port = spawn_echo_server().await;
        let local_port = free_port().await;
        let handle = manager
            .create_tunnel("gw", "127.0.0.1", local_port, echo_port, TunnelDirection::Forward)
            .await
            .unwrap();

        assert!(manager.probe(&handle).await);
        let info = handle.info();
        assert_eq!(info.local_port, local_port);
        assert_eq!(info.status, TunnelStatus::Open);
        assert_eq!(manager.list_tunnels().len(), 1);

        manager.destroy_tunnel(handle.id()).await.unwrap();
        assert!(!manager.probe(&handle).await);
    }

    #[tokio::test]
    async fn test_end_to_end_ping() {
        let (manager, _) = manager();
        let _echo = spawn_echo_server_on("127.0.0.1:19090").await;

        let handle = manager
            .create_tunnel("gw", "localhost", 19091, 19090, TunnelDirection::Forward)
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", 19091)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        manager.destroy_tunnel(handle.id()).await.unwrap();

        let err = TcpStream::connect(("127.0.0.1", 19091)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }
}
