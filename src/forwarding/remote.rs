//! Reverse relay
//!
//! Asks the gateway to listen on a port and carries every connection it
//! receives there back to a local target.
//! Example: gateway:19090 -> local localhost:19091

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bridge::{drain_connections, pump, ForwardStats, ForwardStatsAtomic};
use crate::config::TunnelOptions;
use crate::ssh::{InboundChannel, SecureTransport, TunnelError};

/// Reverse relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    /// Address the gateway listens on
    pub bind_address: String,
    pub bind_port: u16,
    /// Local target for inbound connections
    pub target_host: String,
    pub target_port: u16,
}

impl RemoteForward {
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
pub enum ReverseState {
    Idle,
    Forwarding,
    Closed,
}

struct ReverseContext {
    target_host: String,
    target_port: u16,
    idle_timeout: Duration,
    stats: Arc<ForwardStatsAtomic>,
}

impl ReverseContext {
    async fn serve(&self, inbound: InboundChannel, close_rx: broadcast::Receiver<()>) {
        let origin = format!("{}:{}", inbound.originator_address, inbound.originator_port);

        let local = match TcpStream::connect((self.target_host.as_str(), self.target_port)).await {
            Ok(stream) => stream,
            Err(e) => {
                // Dropping the channel closes it on the gateway side
                warn!(
                    "Cannot reach {}:{} for {}: {}",
                    self.target_host, self.target_port, origin, e
                );
                return;
            }
        };
        if let Err(e) = local.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        match pump(inbound.stream, local, &self.stats, self.idle_timeout, close_rx).await {
            Err(e) if e.is_connection_scoped() => {
                debug!("Reverse connection from {} ended with error: {}", origin, e)
            }
            Err(e) => warn!("Reverse connection from {} failed: {}", origin, e),
            Ok(()) => {}
        }
        debug!("Reverse connection from {} closed", origin);
    }
}

pub struct ReverseRelay {
    config: RemoteForward,
    transport: Arc<dyn SecureTransport>,
    idle_timeout: Duration,
    shutdown_grace: Duration,
    poll_interval: Duration,
    state: parking_lot::Mutex<ReverseState>,
    bound_port: Option<u16>,
    running: Arc<AtomicBool>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    close_tx: broadcast::Sender<()>,
    stats: Arc<ForwardStatsAtomic>,
}

impl ReverseRelay {
    pub fn new(
        config: RemoteForward,
        transport: Arc<dyn SecureTransport>,
        options: &TunnelOptions,
    ) -> Self {
        let (close_tx, _) = broadcast::channel(1);
        Self {
            config,
            transport,
            idle_timeout: options.idle_timeout(),
            shutdown_grace: options.shutdown_grace(),
            poll_interval: options.accept_poll_interval(),
            state: parking_lot::Mutex::new(ReverseState::Idle),
            bound_port: None,
            running: Arc::new(AtomicBool::new(false)),
            accept_task: parking_lot::Mutex::new(None),
            close_tx,
            stats: Arc::new(ForwardStatsAtomic::new()),
        }
    }

    /// Request the remote forward and spawn the accept loop. Returns the port
    /// the gateway actually bound.
    pub async fn start(&mut self) -> Result<u16, TunnelError> {
        if *self.state.lock() != ReverseState::Idle {
            return Err(TunnelError::Config("reverse relay already started".into()));
        }

        let bound_port = self
            .transport
            .request_remote_forward(&self.config.bind_address, self.config.bind_port)
            .await?;

        info!(
            "Reverse forwarding gateway {}:{} -> {}:{}",
            self.config.bind_address, bound_port, self.config.target_host, self.config.target_port
        );

        let context = Arc::new(ReverseContext {
            target_host: self.config.target_host.clone(),
            target_port: self.config.target_port,
            idle_timeout: self.idle_timeout,
            stats: self.stats.clone(),
        });

        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(accept_loop(
            self.transport.clone(),
            context,
            self.running.clone(),
            self.poll_interval,
            self.close_tx.clone(),
        ));

        self.bound_port = Some(bound_port);
        *self.accept_task.lock() = Some(task);
        *self.state.lock() = ReverseState::Forwarding;
        Ok(bound_port)
    }

    /// Clear the running flag, wait for the accept loop (at most one poll
    /// interval), cancel the remote forward and drain pumps. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ReverseState::Forwarding {
                *state = ReverseState::Closed;
                return;
            }
            *state = ReverseState::Closed;
        }

        info!(
            "Stopping reverse forward {}:{}",
            self.config.bind_address,
            self.bound_port.unwrap_or(self.config.bind_port)
        );
        self.running.store(false, Ordering::SeqCst);

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Reverse accept loop ended abnormally: {}", e);
            }
        }

        if let Some(port) = self.bound_port {
            if let Err(e) = self
                .transport
                .cancel_remote_forward(&self.config.bind_address, port)
                .await
            {
                warn!("Failed to cancel remote forward: {}", e);
            }
        }

        if let Err(e) = drain_connections(&self.stats, self.shutdown_grace, &self.close_tx).await
        {
            warn!(
                "Reverse forward {}:{}: {}",
                self.config.bind_address, self.config.bind_port, e
            );
        }
    }

    pub fn state(&self) -> ReverseState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.to_stats()
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.bound_port
    }

    pub fn config(&self) -> &RemoteForward {
        &self.config
    }
}

async fn accept_loop(
    transport: Arc<dyn SecureTransport>,
    context: Arc<ReverseContext>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    close_tx: broadcast::Sender<()>,
) {
    while running.load(Ordering::SeqCst) {
        let Some(inbound) = transport.accept_channel(poll_interval).await else {
            if !transport.is_connected() {
                warn!("Transport lost, reverse accept loop exiting");
                running.store(false, Ordering::SeqCst);
                break;
            }
            continue;
        };

        if !running.load(Ordering::SeqCst) {
            break;
        }
        debug!("Accepted {:?}", inbound);

        let guard = context.stats.track();
        let context = context.clone();
        let close_rx = close_tx.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            context.serve(inbound, close_rx).await;
        });
    }

    debug!("Reverse accept loop exited");
}
