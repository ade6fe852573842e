//! Shared building blocks for the `cpu` remote-execution client.
//!
//! This crate holds everything the client binary needs that is independent
//! of the SSH transport: the session configuration assembled from flags and
//! environment, the error taxonomy, and the one-time session nonce that
//! gates the reverse 9p tunnel.

pub mod config;
pub mod error;
pub mod secret;

pub use config::ClientConfig;
pub use error::{ConfigError, SecretError};
pub use secret::Nonce;
