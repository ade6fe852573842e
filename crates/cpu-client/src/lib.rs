//! cpu client library
//!
//! Everything behind the `cpu` binary: the authenticated SSH transport, the
//! reverse 9p tunnel and its admission gate, the remote command launcher,
//! the terminal I/O multiplexer, and the session lifecycle that drives them.

pub mod fileserver;
pub mod gate;
pub mod launch;
pub mod session;
pub mod terminal;
pub mod transport;
pub mod tunnel;

pub use session::run_client;
pub use transport::Transport;
