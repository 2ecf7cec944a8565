//! SSH client: gateway connection and authentication using russh

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::Endpoint;
use super::error::TunnelError;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::prompt::{PasswordPrompt, TerminalPrompt};
use super::transport::{
    InboundChannel, SecureTransport, SshTransport, TransportConnector, INBOUND_QUEUE_CAPACITY,
};
use crate::config::{Configuration, HostKeyPolicy};

/// Keys tried after the endpoint's own identity file
const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Client handler for russh callbacks
///
/// Verifies the gateway host key and queues forwarded-tcpip channels for the
/// transport that owns this session.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
    forwarded_tx: mpsc::Sender<InboundChannel>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Arc<KnownHostsStore>,
        forwarded_tx: mpsc::Sender<InboundChannel>,
    ) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
            forwarded_tx,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => match self.policy {
                HostKeyPolicy::Strict => {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}). Strict mode, rejecting.",
                        self.host, self.port, fingerprint
                    );
                    Err(TunnelError::Auth(format!(
                        "Host key verification failed: unknown host {}:{} ({})",
                        self.host, self.port, fingerprint
                    )))
                }
                HostKeyPolicy::AcceptNew => {
                    info!(
                        "New host {}:{}, adding to known_hosts (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    if let Err(e) =
                        self.known_hosts
                            .add_host(&self.host, self.port, server_public_key)
                    {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
                HostKeyPolicy::Warn => {
                    warn!(
                        "Host {}:{} is not in known_hosts, accepting (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    Ok(true)
                }
            },
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                // Changed keys are rejected under every policy
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(TunnelError::Auth(format!(
                    "Host key for {}:{} has changed (expected {}, got {}). \
                     Remove the old key from known_hosts if the change is legitimate.",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }

    /// Called when someone connects to a port the gateway listens on for us
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Gateway opened forwarded-tcpip channel {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let inbound = InboundChannel {
            stream: Box::new(channel.into_stream()),
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };

        // Must not block the session loop. A full queue drops the channel,
        // which closes it on the gateway side.
        if let Err(e) = self.forwarded_tx.try_send(inbound) {
            warn!(
                "Dropping forwarded channel {}:{}: {}",
                connected_address, connected_port, e
            );
        }

        Ok(())
    }
}

/// Opens authenticated [`SshTransport`]s
pub struct SshConnector {
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
    allow_password_prompt: bool,
    connect_timeout: Duration,
    prompt: Arc<dyn PasswordPrompt>,
}

impl SshConnector {
    pub fn new(config: &Configuration) -> Self {
        Self {
            policy: config.host_key_policy,
            known_hosts: Arc::new(KnownHostsStore::open(config.known_hosts_path.clone())),
            allow_password_prompt: config.allow_password_prompt,
            connect_timeout: config.options.connect_timeout(),
            prompt: Arc::new(TerminalPrompt),
        }
    }

    /// Replace the terminal password prompt
    pub fn with_prompt(mut self, prompt: Arc<dyn PasswordPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        endpoint: &Endpoint,
    ) -> Result<(), TunnelError> {
        for key_path in candidate_keys(endpoint.identity_file.as_deref()) {
            if !key_path.exists() {
                continue;
            }

            let key = match russh::keys::load_secret_key(&key_path, None) {
                Ok(key) => key,
                Err(e) => {
                    debug!("Skipping key {}: {}", key_path.display(), e);
                    continue;
                }
            };

            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            let result = handle
                .authenticate_publickey(&endpoint.username, key_with_hash)
                .await
                .map_err(|e| TunnelError::Auth(e.to_string()))?;

            if result.success() {
                info!("Authenticated to {} with key {}", endpoint, key_path.display());
                return Ok(());
            }
            debug!("Key {} rejected by {}", key_path.display(), endpoint);
        }

        if !self.allow_password_prompt {
            return Err(TunnelError::Auth(format!(
                "No key accepted by {} and password prompting is disabled",
                endpoint
            )));
        }

        let prompt = self.prompt.clone();
        let prompt_text = format!("{}@{}'s password", endpoint.username, endpoint.host);
        let password = tokio::task::spawn_blocking(move || prompt.password(&prompt_text))
            .await
            .map_err(|e| TunnelError::Auth(format!("Password prompt failed: {}", e)))?
            .ok_or_else(|| TunnelError::Auth(format!("No password given for {}", endpoint)))?;

        let result = handle
            .authenticate_password(&endpoint.username, password)
            .await
            .map_err(|e| TunnelError::Auth(e.to_string()))?;

        if result.success() {
            info!("Authenticated to {} with password", endpoint);
            Ok(())
        } else {
            Err(TunnelError::Auth(format!(
                "Authentication rejected by {}",
                endpoint
            )))
        }
    }
}

/// The endpoint's identity file, then the usual `~/.ssh` keys, without repeats
fn candidate_keys(identity_file: Option<&Path>) -> Vec<PathBuf> {
    let mut keys: Vec<PathBuf> = identity_file.map(Path::to_path_buf).into_iter().collect();

    if let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) {
        for name in DEFAULT_KEY_NAMES {
            let path = ssh_dir.join(name);
            if !keys.contains(&path) {
                keys.push(path);
            }
        }
    }

    keys
}

#[async_trait]
impl TransportConnector for SshConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn SecureTransport>, TunnelError> {
        info!("Connecting to gateway {}", endpoint);

        let socket_addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| TunnelError::Auth(format!("Failed to resolve {}: {}", endpoint.host, e)))?
            .next()
            .ok_or_else(|| TunnelError::Auth(format!("No address found for {}", endpoint.host)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let (forwarded_tx, forwarded_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let handler = ClientHandler::new(
            endpoint.host.clone(),
            endpoint.port,
            self.policy,
            self.known_hosts.clone(),
            forwarded_tx,
        );

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| TunnelError::Auth(format!("Connection to {} timed out", endpoint)))?
        .map_err(|e| match e {
            TunnelError::Auth(msg) => TunnelError::Auth(msg),
            other => TunnelError::Auth(format!("Cannot reach {}: {}", endpoint, other)),
        })?;

        debug!("SSH handshake completed with {}", endpoint);

        if let Err(e) = self.authenticate(&mut handle, endpoint).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(e);
        }

        let controller = spawn_handle_owner_task(handle, endpoint.to_string());
        Ok(Arc::new(SshTransport::new(
            endpoint.clone(),
            controller,
            forwarded_rx,
        )))
    }
}
