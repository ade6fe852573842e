//! Namespace export gate
//!
//! The gate sits between the reverse tunnel and the out-of-scope file-share
//! server. It runs in two explicit phases: an admission phase bounded by the
//! rendezvous deadline, waiting for the first connection that presents the
//! session nonce, and an unbounded serving phase for the rest of the
//! session. No connection reaches the file server without passing the nonce
//! check, in either phase.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;

use cpu_core::secret::NONCE_LEN;
use cpu_core::Nonce;

/// A tunneled byte stream delivered by the reverse listener.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// The file-share server behind the gate.
///
/// The wire protocol it speaks is not this crate's concern; the gate only
/// guarantees that `serve` is called with connections that passed the nonce
/// check, and with the exported root.
#[async_trait]
pub trait NamespaceServer: Send + Sync {
    async fn serve(&self, conn: TunnelStream, root: &Path) -> anyhow::Result<()>;
}

/// Serve the gate on the reverse listener's connection stream.
///
/// Returns when the rendezvous deadline passes with no admitted connection
/// (the namespace simply never becomes available; the session is not
/// affected), or when the listener closes at session end.
pub async fn serve(
    mut incoming: mpsc::Receiver<TunnelStream>,
    root: PathBuf,
    nonce: Nonce,
    deadline: Duration,
    server: Arc<dyn NamespaceServer>,
) {
    // Admission phase: the first authenticated connection must arrive
    // within the deadline.
    let first = match timeout(deadline, admit_first(&mut incoming, &nonce)).await {
        Ok(Some(conn)) => conn,
        Ok(None) => {
            tracing::debug!("reverse listener closed before any 9p connection");
            return;
        }
        Err(_) => {
            tracing::warn!(
                "no authenticated 9p connection within {:?}; \
                 continuing without a namespace",
                deadline
            );
            return;
        }
    };

    tracing::debug!("9p rendezvous complete; exporting {}", root.display());
    spawn_serve(Arc::clone(&server), first, root.clone());

    // Serving phase: unbounded, for the life of the session. Every further
    // connection still has to present the nonce.
    while let Some(conn) = incoming.recv().await {
        let server = Arc::clone(&server);
        let root = root.clone();
        let nonce = nonce.clone();
        tokio::spawn(async move {
            match check_admission(conn, &nonce).await {
                Some(conn) => {
                    if let Err(e) = server.serve(conn, &root).await {
                        tracing::warn!("9p server failed: {e:#}");
                    }
                }
                None => tracing::warn!("rejected tunnel connection with bad nonce"),
            }
        });
    }
}

/// Admit connections sequentially until one presents the nonce.
async fn admit_first(
    incoming: &mut mpsc::Receiver<TunnelStream>,
    nonce: &Nonce,
) -> Option<TunnelStream> {
    while let Some(conn) = incoming.recv().await {
        match check_admission(conn, nonce).await {
            Some(conn) => return Some(conn),
            None => tracing::warn!("rejected tunnel connection with bad nonce"),
        }
    }
    None
}

/// Read the fixed-length nonce from the peer and verify it. Returns the
/// connection only when the nonce matches.
async fn check_admission(mut conn: TunnelStream, nonce: &Nonce) -> Option<TunnelStream> {
    let mut presented = [0u8; NONCE_LEN];
    match conn.read_exact(&mut presented).await {
        Ok(_) if nonce.matches(&presented) => Some(conn),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("tunnel connection dropped during admission: {e}");
            None
        }
    }
}

fn spawn_serve(server: Arc<dyn NamespaceServer>, conn: TunnelStream, root: PathBuf) {
    tokio::spawn(async move {
        if let Err(e) = server.serve(conn, &root).await {
            tracing::warn!("9p server failed: {e:#}");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::AsyncWriteExt;

    use super::*;

    /// Records the roots it was asked to serve; the connection is dropped.
    struct RecordingServer {
        served: Mutex<Vec<PathBuf>>,
    }

    impl RecordingServer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                served: Mutex::new(Vec::new()),
            })
        }

        fn serve_count(&self) -> usize {
            self.served.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NamespaceServer for RecordingServer {
        async fn serve(&self, _conn: TunnelStream, root: &Path) -> anyhow::Result<()> {
            self.served.lock().unwrap().push(root.to_path_buf());
            Ok(())
        }
    }

    #[tokio::test]
    async fn rendezvous_times_out_without_a_peer() {
        let (_tx, rx) = mpsc::channel::<TunnelStream>(1);
        let server = RecordingServer::new();
        // Keep _tx alive so the channel does not close early; the deadline
        // must be what ends the wait.
        serve(
            rx,
            PathBuf::from("/"),
            Nonce::generate().unwrap(),
            Duration::from_millis(50),
            server.clone(),
        )
        .await;
        assert_eq!(server.serve_count(), 0);
    }

    #[tokio::test]
    async fn correct_nonce_reaches_the_file_server() {
        let (tx, rx) = mpsc::channel::<TunnelStream>(1);
        let nonce = Nonce::generate().unwrap();
        let server = RecordingServer::new();

        let (mut peer, ours) = tokio::io::duplex(256);
        tx.send(Box::new(ours)).await.unwrap();
        peer.write_all(nonce.expose().as_bytes()).await.unwrap();
        drop(tx);

        serve(
            rx,
            PathBuf::from("/exported"),
            nonce,
            Duration::from_secs(1),
            server.clone(),
        )
        .await;

        // The admitted connection is served on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.serve_count(), 1);
        assert_eq!(
            server.served.lock().unwrap()[0],
            PathBuf::from("/exported")
        );
    }

    #[tokio::test]
    async fn wrong_nonce_never_reaches_the_file_server() {
        let (tx, rx) = mpsc::channel::<TunnelStream>(1);
        let nonce = Nonce::generate().unwrap();
        let server = RecordingServer::new();

        let (mut peer, ours) = tokio::io::duplex(256);
        tx.send(Box::new(ours)).await.unwrap();
        peer.write_all(&[b'x'; NONCE_LEN]).await.unwrap();
        drop(tx);

        serve(
            rx,
            PathBuf::from("/"),
            nonce,
            Duration::from_millis(100),
            server.clone(),
        )
        .await;

        assert_eq!(server.serve_count(), 0);
    }

    #[tokio::test]
    async fn second_connection_is_still_checked() {
        let (tx, rx) = mpsc::channel::<TunnelStream>(2);
        let nonce = Nonce::generate().unwrap();
        let server = RecordingServer::new();

        let (mut first, ours) = tokio::io::duplex(256);
        tx.send(Box::new(ours)).await.unwrap();
        first.write_all(nonce.expose().as_bytes()).await.unwrap();

        let (mut second, ours) = tokio::io::duplex(256);
        tx.send(Box::new(ours)).await.unwrap();
        second.write_all(&[b'x'; NONCE_LEN]).await.unwrap();
        drop(tx);

        serve(
            rx,
            PathBuf::from("/"),
            nonce,
            Duration::from_secs(1),
            server.clone(),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.serve_count(), 1);
    }
}
