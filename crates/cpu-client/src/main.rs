//! cpu — run a command on a remote host with your local namespace along
//!
//! `cpu [options] host [command...]` authenticates to the cpu service on
//! `host`, exports part of the local filesystem back to the remote process
//! over a nonce-gated reverse tunnel, and runs the command (or your shell)
//! on the remote side with your terminal attached.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cpu_client::fileserver::StdioFileServer;
use cpu_client::session::{run_client, ClientError};
use cpu_client::transport::TransportError;
use cpu_core::config::{default_command, default_key_path, namespace_enabled};
use cpu_core::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "cpu")]
#[command(version, about = "Run a command on a remote host with your local namespace exported")]
struct Cli {
    /// Path of the cpu binary on the remote machine (empty: resolve a
    /// local `cpu` from PATH)
    #[arg(long, default_value = "cpud")]
    bin: String,

    /// Enable debug prints
    #[arg(short = 'd', long)]
    debug: bool,

    /// Show 9p I/O
    #[arg(long)]
    dbg9p: bool,

    /// Dump copious output, including a 9p trace, to a temp file at exit
    #[arg(long, conflicts_with = "debug")]
    dump: bool,

    /// File containing the expected host key. Without it the host's
    /// identity is NOT verified.
    #[arg(long = "hk", value_name = "FILE")]
    host_key: Option<PathBuf>,

    /// Private key file [default: $HOME/.ssh/cpu_rsa]
    #[arg(long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// Extra options to add to the 9p mount
    #[arg(long)]
    mountopts: Option<String>,

    /// msize to use for the 9p mount
    #[arg(long, default_value_t = 1_048_576)]
    msize: u32,

    /// Network to use
    #[arg(long, default_value = "tcp")]
    network: String,

    /// cpu default port
    #[arg(long = "sp", default_value_t = 23, value_name = "PORT")]
    port: u16,

    /// 9p port on the remote machine [default: ephemeral]
    #[arg(long, value_name = "PORT")]
    port9p: Option<u16>,

    /// 9p root to export
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Time to wait for the 9p mount to happen
    #[arg(long = "timeout9p", default_value = "100ms", value_parser = humantime::parse_duration)]
    timeout_9p: Duration,

    /// Host to connect to
    host: String,

    /// Command to run remotely [default: $SHELL]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn into_config(self) -> (ClientConfig, String) {
        let command = self.command.join(" ");
        let cfg = ClientConfig {
            host: self.host,
            port: self.port,
            network: self.network,
            remote_bin: self.bin,
            key_path: self.key.unwrap_or_else(default_key_path),
            host_key_path: self.host_key,
            root: self.root,
            port9p: self.port9p,
            mount_opts: self.mountopts,
            msize: self.msize,
            timeout_9p: self.timeout_9p,
            dbg9p: self.dbg9p || self.dump,
            ..Default::default()
        };
        (cfg, command)
    }
}

/// Route logging to stderr, or to a kept temp file with `--dump`.
fn init_logging(debug: bool, dump: bool) -> anyhow::Result<()> {
    let default_level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| {
            if dump {
                "trace".to_string()
            } else {
                default_level.to_string()
            }
        }),
    );

    if dump {
        let (file, path) = tempfile::Builder::new()
            .prefix("cpu")
            .tempfile()?
            .keep()
            .map_err(|e| anyhow::anyhow!("keeping dump file: {e}"))?;
        eprintln!("logging to {}", path.display());
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
    }
    Ok(())
}

/// Map the session outcome to the process exit status.
///
/// The remote command's exit status passes through when the transport
/// reported one; a session that ended without reporting one is a failure,
/// never a silent success.
fn exit_status(result: Result<Option<u32>, ClientError>) -> u8 {
    match result {
        Ok(Some(status)) => u8::try_from(status).unwrap_or(1),
        Ok(None) => {
            tracing::error!("remote session ended without reporting an exit status");
            1
        }
        Err(ClientError::Transport(TransportError::CommandFailed { command, status })) => {
            tracing::error!("remote command {command:?} exited with status {status}");
            u8::try_from(status).unwrap_or(1)
        }
        Err(e) => {
            tracing::error!("cpu: {e}");
            1
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // `--help` and `--version` land here too; only genuine usage
            // errors exit nonzero.
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    if let Err(e) = init_logging(cli.debug, cli.dump) {
        eprintln!("cpu: {e:#}");
        return ExitCode::FAILURE;
    }

    let (cfg, mut command) = cli.into_config();
    if command.is_empty() {
        command = default_command();
    }

    let namespace = namespace_enabled();
    let server = Arc::new(StdioFileServer::from_config(&cfg));

    ExitCode::from(exit_status(run_client(&cfg, &command, namespace, server).await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_exit_status_passes_through() {
        assert_eq!(exit_status(Ok(Some(0))), 0);
        assert_eq!(exit_status(Ok(Some(3))), 3);
        // Out-of-range statuses collapse to the generic failure code.
        assert_eq!(exit_status(Ok(Some(300))), 1);
    }

    #[test]
    fn missing_exit_status_is_a_failure() {
        assert_eq!(exit_status(Ok(None)), 1);
    }

    #[test]
    fn one_shot_command_failure_carries_its_status() {
        let err = ClientError::Transport(TransportError::CommandFailed {
            command: "date".to_string(),
            status: 7,
        });
        assert_eq!(exit_status(Err(err)), 7);
    }

    #[test]
    fn help_and_version_are_not_usage_errors() {
        let help = Cli::try_parse_from(["cpu", "--help"]).unwrap_err();
        assert_eq!(help.kind(), ErrorKind::DisplayHelp);
        let version = Cli::try_parse_from(["cpu", "--version"]).unwrap_err();
        assert_eq!(version.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn missing_host_is_a_usage_error() {
        let err = Cli::try_parse_from(["cpu"]).unwrap_err();
        assert!(!matches!(
            err.kind(),
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
        ));
    }
}
