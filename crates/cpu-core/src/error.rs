//! Error taxonomy shared across the cpu client
//!
//! Fatal errors unwind to the top level and map to a nonzero exit status.
//! Non-fatal conditions (rendezvous timeout, per-variable env failures,
//! terminal restore failures) are logged where they occur and never appear
//! here.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to produce the session nonce.
#[derive(Error, Debug)]
pub enum SecretError {
    /// The OS random source failed. Fatal; there is no fallback source.
    #[error("random source failure: {0}")]
    RandomSource(#[source] rand::Error),
}

/// Configuration errors. Fatal, never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Private key file could not be read.
    #[error("unable to read private key {path}: {source}")]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Private key file could not be parsed.
    #[error("unable to parse private key {path}: {message}")]
    KeyParse { path: PathBuf, message: String },

    /// Host key file could not be read.
    #[error("unable to read host key {path}: {source}")]
    HostKeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Host key file is neither a raw public key nor an authorized-key line.
    #[error("unable to parse host key {path}")]
    HostKeyParse { path: PathBuf },

    /// Only tcp is supported.
    #[error("unsupported network {0:?} (only \"tcp\" is supported)")]
    UnsupportedNetwork(String),

    /// No usable remote binary path.
    #[error("cannot resolve cpu binary: {0}")]
    BinResolve(String),
}
