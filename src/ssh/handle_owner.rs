//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Transports and relays talk
//! to it through a cloneable [`HandleController`] which sends commands over an
//! mpsc channel, so the handle is never shared behind a lock or touched
//! concurrently.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::TunnelError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (forward tunnels)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it copies a sender). Any holder has full control of the
/// session, so controllers never leave the transport that created them.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task has torn the session down
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to SSH disconnect notifications.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::ChannelRejected(format!("{}:{}: {}", host, port, e)))
    }

    /// Request remote port forward (tcpip-forward)
    ///
    /// Returns the actual bound port (may differ if requested port was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(TunnelError::from)
    }

    /// Cancel a remote port forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(TunnelError::from)
    }

    /// Ask the owner task to disconnect and wait until it has
    pub async fn disconnect_and_wait(&self, timeout: Duration) -> Result<(), TunnelError> {
        if !self.is_connected() {
            return Ok(());
        }
        let mut disconnect_rx = self.subscribe_disconnect();
        if self.cmd_tx.send(HandleCommand::Disconnect).await.is_err() {
            // Owner task already gone
            return Ok(());
        }
        match tokio::time::timeout(timeout, disconnect_rx.recv()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(TunnelError::Timeout(format!(
                "session did not disconnect within {:?}",
                timeout
            ))),
        }
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;

        debug!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped here, the server closes it
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = if *bound_port == 0 { port } else { *bound_port };
                            if reply_tx.send(result).is_err() {
                                // Nobody owns this forward any more; cancel it now
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;

        // Notify subscribers last, once the session is really gone
        let _ = disconnect_tx_clone.send(());
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Fail every queued command with a disconnect error
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
