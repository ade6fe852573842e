//! Session lifecycle
//!
//! Drives one invocation end to end: connect, arm the namespace tunnel,
//! enter raw mode, launch the remote command, relay I/O, and map the
//! outcome to an exit status. Terminal restoration is guaranteed on every
//! exit path and happens after the remote command's completion is awaited,
//! so it cannot race the remote process's own terminal manipulation.

use std::sync::Arc;

use thiserror::Error;

use cpu_core::{ClientConfig, ConfigError, Nonce, SecretError};

use crate::gate::NamespaceServer;
use crate::launch::{self, build_remote_command};
use crate::terminal::{self, RawModeGuard};
use crate::transport::{Transport, TransportError};
use crate::tunnel::{self, TunnelError};

/// Fatal session errors. Everything here unwinds to the top level and maps
/// to a nonzero exit status.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("terminal setup failed: {0}")]
    Terminal(#[from] std::io::Error),
}

/// Run one client session against `cfg.host`.
///
/// `command` is the remote command string (the caller substitutes `SHELL`
/// for an empty one); `namespace` selects whether the local root is
/// exported. Returns the remote command's exit status when the transport
/// reported one.
pub async fn run_client(
    cfg: &ClientConfig,
    command: &str,
    namespace: bool,
    server: Arc<dyn NamespaceServer>,
) -> Result<Option<u32>, ClientError> {
    let mut transport = Transport::connect(cfg).await?;
    tracing::debug!("connected to {}", transport.address());

    let mut raw = RawModeGuard::enter()?;
    let status = run_in_raw_mode(&mut transport, cfg, command, namespace, server).await;
    // Restore only after the remote command's completion has been awaited.
    raw.restore();
    status
}

async fn run_in_raw_mode(
    transport: &mut Transport,
    cfg: &ClientConfig,
    command: &str,
    namespace: bool,
    server: Arc<dyn NamespaceServer>,
) -> Result<Option<u32>, ClientError> {
    let bin = resolve_remote_bin(&cfg.remote_bin)?;

    let (port9p, nonce) = if namespace {
        let nonce = Nonce::generate()?;
        let port = tunnel::negotiate(
            transport,
            cfg.port9p.unwrap_or(0),
            &cfg.root,
            nonce.clone(),
            cfg.timeout_9p,
            server,
        )
        .await?;
        (Some(port), Some(nonce))
    } else {
        tracing::debug!("namespace export disabled for this invocation");
        (None, None)
    };

    let remote_command = build_remote_command(&bin, port9p, command);
    tracing::debug!("command is {:?}", remote_command);

    let session = launch::launch(transport, &remote_command, nonce.as_ref()).await?;
    let status = terminal::run_session(session).await?;
    Ok(status)
}

/// Resolve the remote binary path. An empty `--bin` means "use a local
/// `cpu` binary found on PATH", mirroring the remote layout.
fn resolve_remote_bin(configured: &str) -> Result<String, ConfigError> {
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }
    let found = which::which("cpu").map_err(|e| ConfigError::BinResolve(e.to_string()))?;
    Ok(found.to_string_lossy().into_owned())
}
