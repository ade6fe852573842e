//! Authenticated SSH transport
//!
//! One `Transport` is one authenticated connection to the remote host. It
//! exposes the three capabilities the session needs: one-shot command
//! execution, an interactive exec session, and a reverse listener whose
//! accepted connections are tunneled back to us for the namespace gate.

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use thiserror::Error;
use tokio::sync::mpsc;

use cpu_core::{ClientConfig, ConfigError};

use crate::gate::TunnelStream;
use crate::launch::ExecSession;

/// Capacity of the queue between the SSH handler and the namespace gate.
/// The remote side opens at most a handful of 9p connections.
const FORWARDED_CHANNEL_CAPACITY: usize = 16;

/// Transport-level errors. All fatal; `connect` never retries.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Bad key material or flags.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The single dial attempt failed.
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: anyhow::Error,
    },

    /// The remote host rejected our key.
    #[error("authentication as {user} rejected by {address}")]
    AuthRejected { user: String, address: String },

    /// The remote side refused the reverse-listen request.
    #[error("reverse listen on {address} refused by remote")]
    ListenRefused { address: String },

    /// Only one reverse listener exists per session.
    #[error("reverse listener already taken for this session")]
    ListenerTaken,

    /// The remote side refused our pseudo-terminal request.
    #[error("request for pseudo terminal refused by remote")]
    PtyRefused,

    /// The remote side refused to start the command.
    #[error("remote refused to start {command:?}")]
    ExecRefused { command: String },

    /// A one-shot remote command exited nonzero.
    #[error("remote command {command:?} exited with status {status}")]
    CommandFailed { command: String, status: u32 },

    /// Anything the SSH layer reports directly.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Host identity policy for the transport.
///
/// `TrustAny` is the preserved default when no host key file is given: the
/// remote host's identity is NOT verified. That relaxation is deliberate
/// and is logged loudly on every connect; pass `--hk` to pin a key.
#[derive(Debug)]
enum HostKeyPolicy {
    TrustAny,
    Fixed(PublicKey),
}

impl HostKeyPolicy {
    /// Load the policy from an optional host key file. The file may be an
    /// OpenSSH public-key line (`ssh-ed25519 AAAA... comment`) or a bare
    /// base64 key.
    fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::TrustAny);
        };

        if let Ok(key) = russh_keys::load_public_key(path) {
            return Ok(Self::Fixed(key));
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::HostKeyRead {
            path: path.to_path_buf(),
            source,
        })?;
        for token in raw.split_whitespace() {
            if let Ok(key) = russh_keys::parse_public_key_base64(token) {
                return Ok(Self::Fixed(key));
            }
        }

        Err(ConfigError::HostKeyParse {
            path: path.to_path_buf(),
        })
    }
}

/// SSH client handler: host key checks plus delivery of reverse-forwarded
/// connections to the namespace gate.
struct ClientHandler {
    policy: HostKeyPolicy,
    forwarded_tx: mpsc::Sender<TunnelStream>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::TrustAny => {
                tracing::warn!(
                    "host key verification disabled (no --hk given); \
                     accepting {} unverified",
                    server_public_key.fingerprint()
                );
                Ok(true)
            }
            HostKeyPolicy::Fixed(expected) => {
                if server_public_key.public_key_base64() == expected.public_key_base64() {
                    tracing::debug!("host key verified: {}", server_public_key.fingerprint());
                    Ok(true)
                } else {
                    tracing::error!(
                        "host key mismatch: expected {}, got {}",
                        expected.fingerprint(),
                        server_public_key.fingerprint()
                    );
                    Ok(false)
                }
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "forwarded connection from {}:{} to {}:{}",
            originator_address,
            originator_port,
            connected_address,
            connected_port
        );
        let stream: TunnelStream = Box::new(channel.into_stream());
        if self.forwarded_tx.send(stream).await.is_err() {
            tracing::debug!("no namespace gate running; dropping forwarded connection");
        }
        Ok(())
    }
}

/// A reverse listening endpoint allocated on the remote host.
///
/// The address is known only once the remote side grants it; connections it
/// accepts are delivered here over the already-authenticated transport.
pub struct ReverseListener {
    address: String,
    incoming: mpsc::Receiver<TunnelStream>,
}

impl ReverseListener {
    /// The `host:port` address the remote side bound.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn into_parts(self) -> (String, mpsc::Receiver<TunnelStream>) {
        (self.address, self.incoming)
    }
}

/// One authenticated connection to a remote host.
pub struct Transport {
    handle: client::Handle<ClientHandler>,
    address: String,
    forwarded_rx: Option<mpsc::Receiver<TunnelStream>>,
}

impl Transport {
    /// Authenticate to the remote host. Exactly one dial attempt.
    ///
    /// Key problems are configuration errors, not dial errors, and are
    /// never retried.
    pub async fn connect(cfg: &ClientConfig) -> Result<Self, TransportError> {
        cfg.validate()?;

        if let Err(source) = std::fs::metadata(&cfg.key_path) {
            return Err(ConfigError::KeyRead {
                path: cfg.key_path.clone(),
                source,
            }
            .into());
        }
        let key = russh_keys::load_secret_key(&cfg.key_path, None).map_err(|e| {
            ConfigError::KeyParse {
                path: cfg.key_path.clone(),
                message: e.to_string(),
            }
        })?;

        let policy = HostKeyPolicy::load(cfg.host_key_path.as_deref())?;
        let (forwarded_tx, forwarded_rx) = mpsc::channel(FORWARDED_CHANNEL_CAPACITY);
        let handler = ClientHandler {
            policy,
            forwarded_tx,
        };

        let address = cfg.address();
        tracing::debug!("dialing {}", address);
        let ssh_config = Arc::new(client::Config::default());
        let mut handle = client::connect(ssh_config, address.as_str(), handler)
            .await
            .map_err(|e| TransportError::Dial {
                address: address.clone(),
                source: anyhow!(e),
            })?;

        tracing::debug!("authenticating as {:?}", cfg.username);
        let authenticated = handle
            .authenticate_publickey(&cfg.username, Arc::new(key))
            .await
            .map_err(|e| TransportError::Dial {
                address: address.clone(),
                source: anyhow!("authentication error: {e}"),
            })?;
        if !authenticated {
            return Err(TransportError::AuthRejected {
                user: cfg.username.clone(),
                address,
            });
        }

        Ok(Self {
            handle,
            address,
            forwarded_rx: Some(forwarded_rx),
        })
    }

    /// The address this transport dialed.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run a one-shot remote command and collect its stdout.
    pub async fn run(&self, command: &str) -> Result<Vec<u8>, TransportError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }

        match status {
            Some(0) | None => Ok(output),
            Some(status) => Err(TransportError::CommandFailed {
                command: command.to_string(),
                status,
            }),
        }
    }

    /// Open an interactive exec session.
    pub async fn exec_session(&self) -> Result<ExecSession, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        Ok(ExecSession::new(channel))
    }

    /// Ask the remote side to listen on `host:port` (0 = ephemeral) and
    /// deliver accepted connections back to us.
    pub async fn listen(&mut self, host: &str, port: u16) -> Result<ReverseListener, TransportError> {
        let incoming = self
            .forwarded_rx
            .take()
            .ok_or(TransportError::ListenerTaken)?;

        // A refused forward surfaces as an error from the request itself;
        // on success the server reports the port it actually bound.
        let bound = self
            .handle
            .tcpip_forward(host, u32::from(port))
            .await
            .map_err(|e| {
                tracing::debug!("reverse listen refused: {e}");
                TransportError::ListenRefused {
                    address: format!("{host}:{port}"),
                }
            })?;

        let address = format!("{host}:{bound}");
        tracing::debug!("remote listener bound on {}", address);
        Ok(ReverseListener { address, incoming })
    }
}
