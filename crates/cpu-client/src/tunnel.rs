//! Reverse tunnel negotiator
//!
//! Arms the namespace rendezvous: asks the transport for a loopback reverse
//! listener on the remote side, extracts the allocated port for the remote
//! command line, and spawns the namespace gate on the listener's connection
//! stream. The remote side only ever sees a loopback port; the nonce keeps
//! every other process on that host out of it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use cpu_core::Nonce;

use crate::gate::{self, NamespaceServer};
use crate::transport::{Transport, TransportError};

/// Address the remote side is asked to bind. Loopback only: the namespace
/// export must never be reachable from outside the remote host.
const REMOTE_LISTEN_HOST: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The reverse-listen request failed. Fatal, no fallback.
    #[error("reverse listen failed: {0}")]
    Listen(#[source] TransportError),

    /// The granted listener address was not `host:port`. The transport
    /// handed us something malformed; this is an invariant violation.
    #[error("no port number in listener address {address:?}")]
    AddressParse { address: String },
}

/// Negotiate the reverse tunnel and arm the namespace gate.
///
/// `requested_port` is the remote port to ask for (0 = ephemeral). Returns
/// the granted port to embed in the command line. The gate task outlives
/// the rendezvous deadline and keeps serving for the life of the session.
pub async fn negotiate(
    transport: &mut Transport,
    requested_port: u16,
    root: &Path,
    nonce: Nonce,
    deadline: Duration,
    server: Arc<dyn NamespaceServer>,
) -> Result<u16, TunnelError> {
    let listener = transport
        .listen(REMOTE_LISTEN_HOST, requested_port)
        .await
        .map_err(TunnelError::Listen)?;

    let (address, incoming) = listener.into_parts();
    let port = extract_port(&address)?;
    tracing::debug!("reverse listener at {} (port {})", address, port);

    let root = root.to_path_buf();
    tokio::spawn(gate::serve(incoming, root, nonce, deadline, server));

    Ok(port)
}

/// Extract the port number from a `host:port` address string.
fn extract_port(address: &str) -> Result<u16, TunnelError> {
    let (_, port) = address.rsplit_once(':').ok_or_else(|| TunnelError::AddressParse {
        address: address.to_string(),
    })?;
    port.parse().map_err(|_| TunnelError::AddressParse {
        address: address.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_port_from_granted_address() {
        assert_eq!(extract_port("127.0.0.1:0").unwrap(), 0);
        assert_eq!(extract_port("127.0.0.1:5640").unwrap(), 5640);
    }

    #[test]
    fn address_without_colon_is_an_invariant_violation() {
        let err = extract_port("127.0.0.1").unwrap_err();
        assert!(matches!(err, TunnelError::AddressParse { .. }));
    }

    #[test]
    fn non_numeric_port_is_an_invariant_violation() {
        assert!(extract_port("127.0.0.1:ninep").is_err());
        assert!(extract_port("").is_err());
    }
}
