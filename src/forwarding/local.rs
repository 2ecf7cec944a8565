//! Forward relay
//!
//! Listens on a local address and carries each accepted connection through
//! the transport to a target reachable from the gateway.
//! Example: local 127.0.0.1:19091 -> gateway -> localhost:19090

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bridge::{drain_connections, pump, ForwardStats, ForwardStatsAtomic};
use crate::config::TunnelOptions;
use crate::ssh::{SecureTransport, TunnelError};

/// Forward relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    /// Local address to listen on (e.g. "localhost")
    pub bind_address: String,
    pub bind_port: u16,
    /// Target host as seen from the gateway
    pub target_host: String,
    pub target_port: u16,
}

impl LocalForward {
    pub fn new(
        bind_address: impl Into<String>,
        bind_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            bind_port,
            target_host: target_host.into(),
            target_port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Idle,
    Listening,
    Closed,
}

/// Resolve a bind address, preferring IPv4 so "localhost" means 127.0.0.1
pub async fn resolve_bind_addr(address: &str, port: u16) -> Result<SocketAddr, TunnelError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((address, port))
        .await
        .map_err(|e| TunnelError::Config(format!("Cannot resolve {}: {}", address, e)))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TunnelError::Config(format!("No address found for {}", address)))
}

/// Bind test for `address:port`. Fails with `Conflict` if something already
/// holds it.
pub async fn check_port_available(address: &str, port: u16) -> Result<(), TunnelError> {
    let addr = resolve_bind_addr(address, port).await?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr).map_err(|e| bind_error(address, port, e))?;
    Ok(())
}

fn bind_error(address: &str, port: u16, e: std::io::Error) -> TunnelError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => TunnelError::conflict(address, port),
        _ => TunnelError::Io(e),
    }
}

/// What each connection task needs; cloned per relay, shared by its pumps
struct ForwardContext {
    transport: Arc<dyn SecureTransport>,
    target_host: String,
    target_port: u16,
    idle_timeout: Duration,
    stats: Arc<ForwardStatsAtomic>,
}

impl ForwardContext {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr, close_rx: broadcast::Receiver<()>) {
        let channel = match self
            .transport
            .open_channel(&self.target_host, self.target_port)
            .await
        {
            Ok(channel) => channel,
            // Dropping the stream closes the client; the listener keeps going
            Err(e) if e.is_connection_scoped() => {
                warn!("Closing connection from {}: {}", peer, e);
                return;
            }
            Err(e) => {
                error!("Closing connection from {}, transport unusable: {}", peer, e);
                return;
            }
        };

        match pump(stream, channel, &self.stats, self.idle_timeout, close_rx).await {
            Err(e) if e.is_connection_scoped() => {
                debug!("Connection from {} ended with error: {}", peer, e)
            }
            Err(e) => warn!("Connection from {} failed: {}", peer, e),
            Ok(()) => {}
        }
        debug!("Connection from {} closed", peer);
    }
}

pub struct ForwardRelay {
    config: LocalForward,
    transport: Arc<dyn SecureTransport>,
    idle_timeout: Duration,
    shutdown_grace: Duration,
    state: parking_lot::Mutex<ForwardState>,
    bound_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    stop_tx: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Force-closes pumps still running after the grace period
    close_tx: broadcast::Sender<()>,
    stats: Arc<ForwardStatsAtomic>,
}

impl ForwardRelay {
    pub fn new(
        config: LocalForward,
        transport: Arc<dyn SecureTransport>,
        options: &TunnelOptions,
    ) -> Self {
        let (close_tx, _) = broadcast::channel(1);
        Self {
            config,
            transport,
            idle_timeout: options.idle_timeout(),
            shutdown_grace: options.shutdown_grace(),
            state: parking_lot::Mutex::new(ForwardState::Idle),
            bound_addr: None,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: parking_lot::Mutex::new(None),
            accept_task: parking_lot::Mutex::new(None),
            close_tx,
            stats: Arc::new(ForwardStatsAtomic::new()),
        }
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(&mut self) -> Result<SocketAddr, TunnelError> {
        if *self.state.lock() != ForwardState::Idle {
            return Err(TunnelError::Config("forward relay already started".into()));
        }

        let addr = resolve_bind_addr(&self.config.bind_address, self.config.bind_port).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| bind_error(&self.config.bind_address, self.config.bind_port, e))?;
        let bound_addr = listener.local_addr()?;

        info!(
            "Forwarding {} -> {}:{}",
            bound_addr, self.config.target_host, self.config.target_port
        );

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let context = Arc::new(ForwardContext {
            transport: self.transport.clone(),
            target_host: self.config.target_host.clone(),
            target_port: self.config.target_port,
            idle_timeout: self.idle_timeout,
            stats: self.stats.clone(),
        });

        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(accept_loop(
            listener,
            context,
            self.running.clone(),
            stop_rx,
            self.close_tx.clone(),
        ));

        self.bound_addr = Some(bound_addr);
        *self.stop_tx.lock() = Some(stop_tx);
        *self.accept_task.lock() = Some(task);
        *self.state.lock() = ForwardState::Listening;
        Ok(bound_addr)
    }

    /// Close the listener, then wait for in-flight pumps (force-closing them
    /// after the grace period). Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ForwardState::Listening {
                *state = ForwardState::Closed;
                return;
            }
            *state = ForwardState::Closed;
        }

        info!(
            "Stopping forward on {}:{}",
            self.config.bind_address, self.config.bind_port
        );
        self.running.store(false, Ordering::SeqCst);

        let stop_tx = self.stop_tx.lock().take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(()).await;
        }

        // The listener is dropped when the loop exits; the port is free after this
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Forward accept loop ended abnormally: {}", e);
            }
        }

        if let Err(e) = drain_connections(&self.stats, self.shutdown_grace, &self.close_tx).await
        {
            warn!(
                "Forward on {}:{}: {}",
                self.config.bind_address, self.config.bind_port, e
            );
        }
    }

    pub fn state(&self) -> ForwardState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.to_stats()
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn config(&self) -> &LocalForward {
        &self.config
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ForwardContext>,
    running: Arc<AtomicBool>,
    mut stop_rx: mpsc::Receiver<()>,
    close_tx: broadcast::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!("Forward accept loop stopped by request");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }

                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("Accepted connection from {}", peer);

                        let guard = context.stats.track();
                        let context = context.clone();
                        let close_rx = close_tx.subscribe();
                        tokio::spawn(async move {
                            let _guard = guard;
                            context.serve(stream, peer, close_rx).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!("Forward accept loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{free_port, spawn_echo_server, LoopbackTransport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options() -> TunnelOptions {
        TunnelOptions {
            shutdown_grace_ms: 200,
            ..TunnelOptions::default()
        }
    }

    #[tokio::test]
    async fn test_forward_echo_and_stop() {
        let echo_port = spawn_echo_server().await;
        let transport = LoopbackTransport::new();
        let mut relay = ForwardRelay::new(
            LocalForward::new("127.0.0.1", 0, "127.0.0.1", echo_port),
            transport,
            &options(),
        );
        assert_eq!(relay.state(), ForwardState::Idle);

        let addr = relay.start().await.unwrap();
        assert_eq!(relay.state(), ForwardState::Listening);
        assert!(relay.is_running());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        relay.stop().await;
        assert_eq!(relay.state(), ForwardState::Closed);
        assert!(!relay.is_running());
        assert!(TcpStream::connect(addr).await.is_err());

        // Second stop is a no-op
        relay.stop().await;
        assert_eq!(relay.stats().connection_count, 1);
    }

    #[tokio::test]
    async fn test_rejected_channel_keeps_listening() {
        let echo_port = spawn_echo_server().await;
        let transport = LoopbackTransport::new();
        let mut relay = ForwardRelay::new(
            LocalForward::new("127.0.0.1", 0, "127.0.0.1", echo_port),
            transport.clone(),
            &options(),
        );
        let addr = relay.start().await.unwrap();

        transport.set_reject_channels(true);
        let mut rejected = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        // Server side closes the client without data
        let n = rejected.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        transport.set_reject_channels(false);
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"again").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
        assert!(relay.is_running());

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_lost_transport_keeps_listener() {
        let echo_port = spawn_echo_server().await;
        let transport = LoopbackTransport::new();
        let mut relay = ForwardRelay::new(
            LocalForward::new("127.0.0.1", 0, "127.0.0.1", echo_port),
            transport.clone(),
            &options(),
        );
        let addr = relay.start().await.unwrap();

        // Every channel open now fails with Disconnected
        transport.close().await.unwrap();
        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = Vec::new();
            let n = client.read_to_end(&mut buf).await.unwrap_or(0);
            assert_eq!(n, 0);
        }
        assert!(relay.is_running());
        assert_eq!(relay.stats().connection_count, 2);

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        match check_port_available("127.0.0.1", port).await {
            Err(TunnelError::Conflict { address, port: p }) => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("expected Conflict, got {:?}", other),
        }

        let mut relay = ForwardRelay::new(
            LocalForward::new("127.0.0.1", port, "127.0.0.1", 1),
            LoopbackTransport::new(),
            &options(),
        );
        assert!(matches!(
            relay.start().await,
            Err(TunnelError::Conflict { .. })
        ));
        assert_eq!(relay.state(), ForwardState::Idle);
    }

    #[tokio::test]
    async fn test_port_available_after_stop() {
        let port = free_port().await;
        check_port_available("localhost", port).await.unwrap();

        let mut relay = ForwardRelay::new(
            LocalForward::new("localhost", port, "127.0.0.1", 1),
            LoopbackTransport::new(),
            &options(),
        );
        relay.start().await.unwrap();
        assert!(check_port_available("localhost", port).await.is_err());

        relay.stop().await;
        check_port_available("localhost", port).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_prefers_ipv4() {
        let addr = resolve_bind_addr("localhost", 80).await.unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 80);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let relay = ForwardRelay::new(
            LocalForward::new("127.0.0.1", 0, "127.0.0.1", 1),
            LoopbackTransport::new(),
            &options(),
        );
        relay.stop().await;
        assert_eq!(relay.state(), ForwardState::Closed);
    }
}
