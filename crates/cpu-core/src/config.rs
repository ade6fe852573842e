//! Client session configuration
//!
//! One `ClientConfig` is assembled from flags and environment at startup and
//! threaded into the components that need it. Nothing here reads mutable
//! process-wide state after construction.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable that disables the namespace export when set to the
/// empty string. Unset or non-empty means the namespace is exported.
pub const CPU_NAMESPACE_ENV: &str = "CPU_NAMESPACE";

/// Environment variable carrying the session nonce to the remote process.
pub const CPU_NONCE_ENV: &str = "CPUNONCE";

/// Default remote port for the cpu service.
pub const DEFAULT_PORT: u16 = 23;

/// Default time allowed between arming the reverse listener and the first
/// authenticated 9p connection. Deliberately short: by the time we arm the
/// listener the remote server is already forked and waiting.
pub const DEFAULT_RENDEZVOUS_DEADLINE: Duration = Duration::from_millis(100);

/// Configuration for one client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote host to dial.
    pub host: String,

    /// Remote port the cpu service listens on.
    pub port: u16,

    /// Network to use. Only `tcp` is supported.
    pub network: String,

    /// Path of the cpu binary on the remote machine. Empty means "resolve
    /// a local `cpu` binary from PATH".
    pub remote_bin: String,

    /// Private key used for transport authentication.
    pub key_path: PathBuf,

    /// Expected host key file. `None` disables host identity verification,
    /// which is the preserved (insecure) default.
    pub host_key_path: Option<PathBuf>,

    /// Remote authentication identity.
    pub username: String,

    /// Local filesystem root exported over the tunnel.
    pub root: PathBuf,

    /// Remote port requested for the 9p listener. `None` asks the remote
    /// side for an ephemeral port.
    pub port9p: Option<u16>,

    /// Extra options for the remote 9p mount, handed to the file server.
    pub mount_opts: Option<String>,

    /// 9p msize handed to the file server.
    pub msize: u32,

    /// Rendezvous deadline for the first authenticated 9p connection.
    pub timeout_9p: Duration,

    /// Trace bytes crossing the 9p bridge.
    pub dbg9p: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            network: "tcp".to_string(),
            remote_bin: "cpud".to_string(),
            key_path: default_key_path(),
            host_key_path: None,
            username: env::var("USER").unwrap_or_else(|_| whoami::username()),
            root: PathBuf::from("/"),
            port9p: None,
            mount_opts: None,
            msize: 1_048_576,
            timeout_9p: DEFAULT_RENDEZVOUS_DEADLINE,
            dbg9p: false,
        }
    }
}

impl ClientConfig {
    /// The dial address for the transport.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values the transport cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network != "tcp" {
            return Err(ConfigError::UnsupportedNetwork(self.network.clone()));
        }
        Ok(())
    }
}

/// Default private key path, `$HOME/.ssh/cpu_rsa`.
pub fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ssh")
        .join("cpu_rsa")
}

/// Whether this invocation exports a namespace.
///
/// `CPU_NAMESPACE` set to the empty string disables the export. Unset, or
/// set to anything non-empty, leaves it enabled.
pub fn namespace_enabled() -> bool {
    match env::var_os(CPU_NAMESPACE_ENV) {
        Some(v) if v.is_empty() => false,
        _ => true,
    }
}

/// The command to run remotely when the user gave none: the local `SHELL`.
pub fn default_command() -> String {
    env::var("SHELL").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_joins_host_and_port() {
        let cfg = ClientConfig {
            host: "testhost".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.address(), "testhost:23");
    }

    #[test]
    fn only_tcp_is_accepted() {
        let mut cfg = ClientConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.network = "unix".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsupportedNetwork(_))
        ));
    }

    #[test]
    fn default_key_path_lives_under_home_ssh() {
        let path = default_key_path();
        assert!(path.ends_with(".ssh/cpu_rsa"));
    }

    // namespace_enabled() reads the process environment; the empty-value
    // and unset cases are covered in the client crate's lifecycle tests,
    // which own env mutation for the whole test binary.
}
