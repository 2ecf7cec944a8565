//! Secure transport seam
//!
//! A [`SecureTransport`] is one authenticated session to one gateway. Relays
//! only ever see this trait; [`SshTransport`] backs it with russh.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::config::Endpoint;
use super::error::TunnelError;
use super::handle_owner::HandleController;

/// Byte stream of one virtual channel
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type VirtualChannel = Box<dyn ChannelIo>;

/// A channel the gateway opened back to us for a remote forward
pub struct InboundChannel {
    pub stream: VirtualChannel,
    /// Address/port the gateway accepted the connection on
    pub connected_address: String,
    pub connected_port: u32,
    /// Peer that connected on the gateway side
    pub originator_address: String,
    pub originator_port: u32,
}

impl fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundChannel")
            .field("connected_address", &self.connected_address)
            .field("connected_port", &self.connected_port)
            .field("originator_address", &self.originator_address)
            .field("originator_port", &self.originator_port)
            .finish()
    }
}

/// One authenticated session to a gateway, exclusively owned by one tunnel
#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// Open a virtual stream to `host:port` as seen from the gateway
    async fn open_channel(&self, host: &str, port: u16) -> Result<VirtualChannel, TunnelError>;

    /// Ask the gateway to listen on `address:port` and send connections back
    /// through this session. Returns the port actually bound.
    async fn request_remote_forward(&self, address: &str, port: u16) -> Result<u16, TunnelError>;

    async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<(), TunnelError>;

    /// Wait up to `timeout` for an inbound channel. `None` on timeout.
    async fn accept_channel(&self, timeout: Duration) -> Option<InboundChannel>;

    /// Terminate the session. Idempotent.
    async fn close(&self) -> Result<(), TunnelError>;

    fn is_connected(&self) -> bool;
}

/// Opens transports to resolved endpoints
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn SecureTransport>, TunnelError>;
}

/// Capacity of the queue between the russh handler and `accept_channel`
pub(crate) const INBOUND_QUEUE_CAPACITY: usize = 64;

/// russh-backed transport
pub struct SshTransport {
    endpoint: Endpoint,
    controller: HandleController,
    inbound_rx: Mutex<mpsc::Receiver<InboundChannel>>,
    closed: AtomicBool,
}

impl SshTransport {
    pub(crate) fn new(
        endpoint: Endpoint,
        controller: HandleController,
        inbound_rx: mpsc::Receiver<InboundChannel>,
    ) -> Self {
        Self {
            endpoint,
            controller,
            inbound_rx: Mutex::new(inbound_rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl SecureTransport for SshTransport {
    async fn open_channel(&self, host: &str, port: u16) -> Result<VirtualChannel, TunnelError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        debug!("Opened direct-tcpip channel to {}:{} via {}", host, port, self.endpoint);
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_forward(&self, address: &str, port: u16) -> Result<u16, TunnelError> {
        let bound = self
            .controller
            .tcpip_forward(address, port as u32)
            .await
            .map_err(|e| match e {
                TunnelError::Disconnected => TunnelError::Disconnected,
                other => TunnelError::Auth(format!(
                    "Gateway {} refused to listen on {}:{}: {}",
                    self.endpoint, address, port, other
                )),
            })?;
        // A fixed port request is answered with 0 by some servers
        let bound = if bound == 0 { port } else { bound as u16 };
        info!("Gateway {} listening on {}:{}", self.endpoint, address, bound);
        Ok(bound)
    }

    async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<(), TunnelError> {
        self.controller
            .cancel_tcpip_forward(address, port as u32)
            .await
    }

    async fn accept_channel(&self, timeout: Duration) -> Option<InboundChannel> {
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(inbound)) => Some(inbound),
            Ok(None) => {
                // Handler gone: the session is over. Keep the caller's poll cadence.
                drop(rx);
                tokio::time::sleep(timeout).await;
                None
            }
            Err(_) => None,
        }
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing transport to {}", self.endpoint);
        self.controller.disconnect_and_wait(CLOSE_TIMEOUT).await
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.controller.is_connected()
    }
}

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

impl Drop for SshTransport {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("SshTransport to {} dropped without close", self.endpoint);
        }
        // Dropping the last controller ends the owner task, which disconnects
    }
}
