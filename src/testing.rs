//! Test helpers: a transport that "tunnels" over plain localhost TCP

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::ssh::{
    Endpoint, InboundChannel, SecureTransport, TransportConnector, TunnelError, VirtualChannel,
};

/// Gateway stand-in: channels are direct TCP connections, remote forwards
/// are local listeners. `port_map` redirects channel targets, standing in for
/// a gateway whose `localhost` is not ours.
pub(crate) struct LoopbackTransport {
    port_map: HashMap<u16, u16>,
    inbound_tx: mpsc::Sender<InboundChannel>,
    inbound_rx: Mutex<mpsc::Receiver<InboundChannel>>,
    forwards: parking_lot::Mutex<HashMap<u16, JoinHandle<()>>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    reject_channels: AtomicBool,
    refuse_forwards: AtomicBool,
}

impl LoopbackTransport {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_port_map(HashMap::new())
    }

    pub(crate) fn with_port_map(port_map: HashMap<u16, u16>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        Arc::new(Self {
            port_map,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            forwards: parking_lot::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            reject_channels: AtomicBool::new(false),
            refuse_forwards: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_reject_channels(&self, reject: bool) {
        self.reject_channels.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn set_refuse_forwards(&self, refuse: bool) {
        self.refuse_forwards.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn has_remote_forward(&self, port: u16) -> bool {
        self.forwards.lock().contains_key(&port)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureTransport for LoopbackTransport {
    async fn open_channel(&self, host: &str, port: u16) -> Result<VirtualChannel, TunnelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Disconnected);
        }
        if self.reject_channels.load(Ordering::SeqCst) {
            return Err(TunnelError::ChannelRejected(format!("{}:{}", host, port)));
        }
        let port = self.port_map.get(&port).copied().unwrap_or(port);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TunnelError::ChannelRejected(format!("{}:{}: {}", host, port, e)))?;
        Ok(Box::new(stream))
    }

    async fn request_remote_forward(&self, address: &str, port: u16) -> Result<u16, TunnelError> {
        if self.refuse_forwards.load(Ordering::SeqCst) {
            return Err(TunnelError::Auth(format!("refused {}:{}", address, port)));
        }
        let listener = TcpListener::bind((address, port)).await?;
        let bound = listener.local_addr()?.port();
        let address = address.to_string();
        let tx = self.inbound_tx.clone();

        let task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let inbound = InboundChannel {
                    stream: Box::new(stream),
                    connected_address: address.clone(),
                    connected_port: bound as u32,
                    originator_address: peer.ip().to_string(),
                    originator_port: peer.port() as u32,
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
        });

        self.forwards.lock().insert(bound, task);
        Ok(bound)
    }

    async fn cancel_remote_forward(&self, _address: &str, port: u16) -> Result<(), TunnelError> {
        let task = self.forwards.lock().remove(&port);
        match task {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(TunnelError::NotFound(format!("remote forward on {}", port))),
        }
    }

    async fn accept_channel(&self, timeout: Duration) -> Option<InboundChannel> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let forwards: Vec<_> = self.forwards.lock().drain().collect();
        for (_, task) in forwards {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out [`LoopbackTransport`]s and remembers them for inspection
#[derive(Default)]
pub(crate) struct LoopbackConnector {
    fail_auth: AtomicBool,
    port_map: parking_lot::Mutex<HashMap<u16, u16>>,
    connected: parking_lot::Mutex<Vec<(Endpoint, Arc<LoopbackTransport>)>>,
}

impl LoopbackConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::SeqCst);
    }

    /// Channels to `remote` on transports connected from now on go to `local`
    pub(crate) fn map_port(&self, remote: u16, local: u16) {
        self.port_map.lock().insert(remote, local);
    }

    pub(crate) fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.connected.lock().iter().map(|(_, t)| t.clone()).collect()
    }

    pub(crate) fn endpoints(&self) -> Vec<Endpoint> {
        self.connected.lock().iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl TransportConnector for LoopbackConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn SecureTransport>, TunnelError> {
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(TunnelError::Auth(format!("denied by {}", endpoint)));
        }
        let port_map = self.port_map.lock().clone();
        let transport = LoopbackTransport::with_port_map(port_map);
        self.connected
            .lock()
            .push((endpoint.clone(), transport.clone()));
        Ok(transport as Arc<dyn SecureTransport>)
    }
}

/// Echo server on an ephemeral port; returns the port
pub(crate) async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });
    port
}

/// Echo server on a fixed address
pub(crate) async fn spawn_echo_server_on(addr: &str) -> JoinHandle<()> {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    })
}

/// A port nothing is listening on right now
pub(crate) async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
