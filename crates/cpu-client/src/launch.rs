//! Remote command launcher
//!
//! Builds the remote cpu invocation, pushes the local environment (plus the
//! session nonce) into the exec session, requests a pseudo-terminal with
//! echo disabled, and starts the command. The running session exposes a
//! stdin writer and demultiplexed stdout/stderr byte streams.

use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use tokio::sync::mpsc;

use cpu_core::config::CPU_NONCE_ENV;
use cpu_core::Nonce;

use crate::transport::{Transport, TransportError};

/// Capacity of the stdout/stderr relay queues, in channel messages.
const RELAY_CHANNEL_CAPACITY: usize = 256;

/// Terminal baud parameters requested for the remote PTY. Echo stays off:
/// the local terminal is the one echoing, and a remote echo would double
/// every keystroke.
const PTY_SPEED: u32 = 14_400;

/// Build the remote invocation.
///
/// The argument string is the user's command, passed through verbatim; the
/// caller has already substituted the local `SHELL` for an empty command.
pub fn build_remote_command(bin: &str, port9p: Option<u16>, args: &str) -> String {
    let mut cmd = format!("{bin} -remote -bin {bin}");
    if let Some(port) = port9p {
        cmd.push_str(&format!(" -port9p {port}"));
    }
    cmd.push(' ');
    cmd.push_str(args);
    cmd
}

/// One remote command invocation bound to a pseudo-terminal.
pub struct ExecSession {
    channel: Channel<Msg>,
}

impl ExecSession {
    pub(crate) fn new(channel: Channel<Msg>) -> Self {
        Self { channel }
    }

    /// Push the full local environment, plus the nonce when the namespace
    /// is exported, into the remote session one variable at a time.
    ///
    /// Individual rejections are warnings, not failures: most servers
    /// accept only an allowlist of names.
    pub async fn propagate_env(&mut self, nonce: Option<&Nonce>) -> Result<(), TransportError> {
        let mut vars: Vec<(String, String)> = std::env::vars().collect();
        if let Some(nonce) = nonce {
            vars.push((CPU_NONCE_ENV.to_string(), nonce.expose().to_string()));
        }

        for (name, value) in vars {
            self.channel.set_env(true, name.as_str(), value.as_str()).await?;
            match self.wait_reply().await? {
                true => {}
                false => tracing::warn!("remote refused environment variable {name:?}"),
            }
        }
        Ok(())
    }

    /// Request the pseudo-terminal the remote command runs under.
    pub async fn request_pty(&mut self) -> Result<(), TransportError> {
        let modes = [
            (Pty::ECHO, 0),
            (Pty::TTY_OP_ISPEED, PTY_SPEED),
            (Pty::TTY_OP_OSPEED, PTY_SPEED),
        ];
        // 80 columns by 40 rows, matching the classic cpu client.
        self.channel
            .request_pty(true, "ansi", 80, 40, 0, 0, &modes)
            .await?;
        if !self.wait_reply().await? {
            return Err(TransportError::PtyRefused);
        }
        Ok(())
    }

    /// Start the remote command and hand back the session's byte streams.
    pub async fn start(mut self, command: &str) -> Result<RunningSession, TransportError> {
        tracing::debug!("starting remote command {:?}", command);
        self.channel.exec(true, command).await?;
        if !self.wait_reply().await? {
            return Err(TransportError::ExecRefused {
                command: command.to_string(),
            });
        }
        Ok(RunningSession::new(self.channel))
    }

    /// Wait for the server's reply to the last want-reply request.
    async fn wait_reply(&mut self) -> Result<bool, TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(true),
                Some(ChannelMsg::Failure) => return Ok(false),
                Some(msg) => tracing::trace!("ignoring channel message {msg:?}"),
                None => return Err(TransportError::Ssh(russh::Error::Disconnect)),
            }
        }
    }
}

/// A started remote command: stdin sink plus stdout/stderr sources and the
/// eventual exit status.
pub struct RunningSession {
    channel: Channel<Msg>,
    stdout_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stderr_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
}

impl RunningSession {
    fn new(channel: Channel<Msg>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        Self {
            channel,
            stdout_rx: Some(stdout_rx),
            stderr_rx: Some(stderr_rx),
            stdout_tx,
            stderr_tx,
        }
    }

    /// Writer feeding the remote stdin. Shutting it down sends EOF, which
    /// is how the escape sequence ends the session's input.
    pub fn stdin(&self) -> impl tokio::io::AsyncWrite + Send + Unpin + 'static {
        self.channel.make_writer()
    }

    /// Take the stdout byte stream. Panics if taken twice.
    pub fn take_stdout(&mut self) -> mpsc::Receiver<Vec<u8>> {
        self.stdout_rx.take().expect("stdout stream already taken")
    }

    /// Take the stderr byte stream. Panics if taken twice.
    pub fn take_stderr(&mut self) -> mpsc::Receiver<Vec<u8>> {
        self.stderr_rx.take().expect("stderr stream already taken")
    }

    /// Drive the session until the remote command completes, demultiplexing
    /// output into the relay queues. Returns the remote exit status when
    /// the server reported one.
    pub async fn wait(mut self) -> Result<Option<u32>, TransportError> {
        let mut status = None;
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    if self.stdout_tx.send(data.to_vec()).await.is_err() {
                        tracing::debug!("stdout relay gone; discarding output");
                    }
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    if self.stderr_tx.send(data.to_vec()).await.is_err() {
                        tracing::debug!("stderr relay gone; discarding output");
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                ChannelMsg::Eof | ChannelMsg::Close => {}
                msg => tracing::trace!("ignoring channel message {msg:?}"),
            }
        }
        Ok(status)
    }
}

/// Open an exec session on the transport, wire up environment and PTY, and
/// start the remote command.
pub async fn launch(
    transport: &Transport,
    command: &str,
    nonce: Option<&Nonce>,
) -> Result<RunningSession, TransportError> {
    let mut session = transport.exec_session().await?;
    session.propagate_env(nonce).await?;
    session.request_pty().await?;
    session.start(command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_with_port_and_shell() {
        let cmd = build_remote_command("cpud", Some(5640), "/bin/bash");
        assert_eq!(cmd, "cpud -remote -bin cpud -port9p 5640 /bin/bash");
    }

    #[test]
    fn command_without_namespace_has_no_port_flag() {
        let cmd = build_remote_command("cpud", None, "date");
        assert_eq!(cmd, "cpud -remote -bin cpud date");
        assert!(!cmd.contains("-port9p"));
    }

    #[test]
    fn argument_string_passes_through_verbatim() {
        let cmd = build_remote_command("/opt/cpu/cpud", Some(1), "ls -l /tmp");
        assert_eq!(cmd, "/opt/cpu/cpud -remote -bin /opt/cpu/cpud -port9p 1 ls -l /tmp");
    }
}
