//! File-share server bridge
//!
//! The 9p wire protocol is served by an external program speaking 9p over
//! stdin/stdout (u9fs-style). `StdioFileServer` spawns one such process per
//! admitted tunnel connection and pumps bytes both ways until either side
//! closes.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

use cpu_core::ClientConfig;

use crate::gate::{NamespaceServer, TunnelStream};

/// Default file-server program. Speaks 9p on stdin/stdout.
const DEFAULT_PROGRAM: &str = "u9fs";

/// Serves each admitted connection by bridging it to a spawned file-server
/// process.
pub struct StdioFileServer {
    program: String,
    args: Vec<String>,
    trace_io: bool,
}

impl StdioFileServer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            trace_io: false,
        }
    }

    /// The default u9fs invocation for this session: no 9p-level auth (the
    /// gate already authenticated the peer), serving as the local user.
    pub fn from_config(cfg: &ClientConfig) -> Self {
        let mut args = vec![
            "-a".to_string(),
            "none".to_string(),
            "-u".to_string(),
            cfg.username.clone(),
        ];
        if cfg.dbg9p {
            args.push("-D".to_string());
        }
        // msize and mount options are negotiated by the remote mount; they
        // are recorded here so a dump shows what the remote side was told.
        tracing::debug!("9p msize {}", cfg.msize);
        if let Some(opts) = &cfg.mount_opts {
            tracing::debug!("extra 9p mount options: {}", opts);
        }
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args,
            trace_io: cfg.dbg9p,
        }
    }
}

#[async_trait]
impl NamespaceServer for StdioFileServer {
    async fn serve(&self, conn: TunnelStream, root: &Path) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning file server {:?}", self.program))?;

        let mut child_in = child.stdin.take().context("file server stdin")?;
        let mut child_out = child.stdout.take().context("file server stdout")?;
        let (mut conn_r, mut conn_w) = tokio::io::split(conn);

        let trace = self.trace_io;
        // Tunnel EOF propagates to the child's stdin; the child closing its
        // stdout ends the bridge. Draining child stdout to EOF guarantees
        // the last responses reach the tunnel before we stop.
        let inbound = tokio::spawn(async move {
            if let Err(e) = pump(&mut conn_r, &mut child_in, "tunnel->9p", trace).await {
                tracing::debug!("tunnel to file server copy ended: {e}");
            }
        });
        pump(&mut child_out, &mut conn_w, "9p->tunnel", trace)
            .await
            .context("copying file server to tunnel")?;
        inbound.abort();

        let status = child.wait().await.context("waiting for file server")?;
        tracing::debug!("file server exited: {}", status);
        Ok(())
    }
}

/// Copy bytes from `r` to `w`, optionally tracing each transfer.
async fn pump(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    direction: &str,
    trace: bool,
) -> std::io::Result<u64> {
    let mut buf = [0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            w.shutdown().await.ok();
            return Ok(total);
        }
        if trace {
            tracing::trace!("9p {} {} bytes", direction, n);
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn bridges_bytes_through_a_child_process() {
        // `cat -` echoes its stdin, standing in for a 9p conversation.
        let server = StdioFileServer::new("cat", vec![]);
        let (mut peer, ours) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            server
                .serve(Box::new(ours), Path::new("-"))
                .await
                .unwrap();
        });

        peer.write_all(b"Tversion").await.unwrap();
        peer.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"Tversion");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let server = StdioFileServer::new("/nonexistent/9p-server", vec![]);
        let (_peer, ours) = tokio::io::duplex(64);
        let err = server.serve(Box::new(ours), Path::new("/")).await;
        assert!(err.is_err());
    }
}
