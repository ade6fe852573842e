//! Terminal I/O multiplexer
//!
//! Turns the raw local terminal into the remote session's stdin, stdout and
//! stderr. The input relay interprets a local-only escape sequence
//! (newline, `~`, command character) that is never forwarded verbatim; the
//! output relays are plain byte copies. Raw mode is entered before any
//! relay starts and restored on every exit path.

use std::io::Write;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::launch::RunningSession;
use crate::transport::TransportError;

/// Scoped raw-mode ownership of the local terminal.
///
/// Restoration is idempotent and must never escalate to a fatal error: a
/// failure here would mask whatever real failure is unwinding the session.
pub struct RawModeGuard {
    restored: bool,
}

impl RawModeGuard {
    /// Snapshot the terminal and enter raw mode.
    pub fn enter() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self { restored: false })
    }

    /// Restore the original terminal mode. Safe to call more than once.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        if let Err(e) = disable_raw_mode() {
            tracing::warn!("failed to restore terminal mode: {e}");
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Input relay state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    AfterNewline,
    EscapeArmed,
}

/// What to do with the byte just fed to the filter.
#[derive(Debug, PartialEq, Eq)]
pub enum FilterOutput {
    /// Forward these bytes to the remote stdin.
    Forward(Vec<u8>),
    /// Swallow the byte; the escape is armed.
    Pending,
    /// Close the remote stdin and stop the input relay.
    CloseSession,
}

/// The escape-sequence filter over the local input byte stream.
///
/// `~` immediately after a newline arms the escape; `.` then ends the
/// session's input, anything else re-emits the held tilde and the byte.
#[derive(Debug, Default)]
pub struct EscapeFilter {
    state: State,
}

impl Default for State {
    fn default() -> Self {
        // A fresh session has no preceding newline; a first-line `~` is
        // literal input.
        State::Normal
    }
}

impl EscapeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one input byte through the state machine.
    pub fn feed(&mut self, byte: u8) -> FilterOutput {
        match self.state {
            State::EscapeArmed => match byte {
                b'.' => FilterOutput::CloseSession,
                _ => {
                    self.state = if is_newline(byte) {
                        State::AfterNewline
                    } else {
                        State::Normal
                    };
                    FilterOutput::Forward(vec![b'~', byte])
                }
            },
            State::AfterNewline if byte == b'~' => {
                self.state = State::EscapeArmed;
                FilterOutput::Pending
            }
            State::Normal | State::AfterNewline => {
                self.state = if is_newline(byte) {
                    State::AfterNewline
                } else {
                    State::Normal
                };
                FilterOutput::Forward(vec![byte])
            }
        }
    }
}

fn is_newline(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

/// The three relay tasks of one interactive session.
pub struct Relays {
    input: JoinHandle<()>,
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl Relays {
    /// Spawn the input, stdout and stderr relays for a running session.
    ///
    /// The relays run until their streams end; session termination is
    /// driven by the remote command's completion, not by joining these.
    pub fn spawn(session: &mut RunningSession) -> Self {
        let stdin_writer = session.stdin();
        let stdout_rx = session.take_stdout();
        let stderr_rx = session.take_stderr();

        let input = tokio::spawn(input_relay(tokio::io::stdin(), stdin_writer));
        let stdout = tokio::spawn(output_relay(stdout_rx, OutputSink::Stdout));
        let stderr = tokio::spawn(output_relay(stderr_rx, OutputSink::Stderr));

        Self {
            input,
            stdout,
            stderr,
        }
    }

    /// Best-effort teardown once the remote command has completed.
    pub fn abort(self) {
        self.input.abort();
        self.stdout.abort();
        self.stderr.abort();
    }
}

/// Relay local input bytes to the remote stdin through the escape filter.
///
/// Stops silently on read failure or stream closure: that is the end of
/// the session, not an error to surface.
pub async fn input_relay(
    mut input: impl tokio::io::AsyncRead + Unpin,
    mut remote_stdin: impl AsyncWrite + Unpin,
) {
    let mut filter = EscapeFilter::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            match filter.feed(byte) {
                FilterOutput::Forward(bytes) => {
                    if remote_stdin.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                FilterOutput::Pending => {}
                FilterOutput::CloseSession => {
                    let _ = remote_stdin.shutdown().await;
                    return;
                }
            }
        }
        if remote_stdin.flush().await.is_err() {
            return;
        }
    }
    let _ = remote_stdin.shutdown().await;
}

enum OutputSink {
    Stdout,
    Stderr,
}

/// Copy remote output bytes to the local terminal.
///
/// Synchronous writes on purpose: stdout/stderr of a terminal do not
/// benefit from async, and interleaving with the raw terminal is simpler
/// this way.
async fn output_relay(mut rx: mpsc::Receiver<Vec<u8>>, sink: OutputSink) {
    while let Some(chunk) = rx.recv().await {
        let result = match sink {
            OutputSink::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(&chunk).and_then(|_| out.flush())
            }
            OutputSink::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(&chunk).and_then(|_| err.flush())
            }
        };
        if result.is_err() {
            break;
        }
    }
}

/// Run one interactive session to completion: spawn the three relays, wait
/// for the remote command, then tear the relays down.
pub async fn run_session(mut session: RunningSession) -> Result<Option<u32>, TransportError> {
    let relays = Relays::spawn(&mut session);
    let status = session.wait().await;
    relays.abort();
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a byte string through the filter, collecting forwarded bytes
    /// until (and excluding) a session close.
    fn run_filter(input: &[u8]) -> (Vec<u8>, bool) {
        let mut filter = EscapeFilter::new();
        let mut forwarded = Vec::new();
        for &b in input {
            match filter.feed(b) {
                FilterOutput::Forward(bytes) => forwarded.extend(bytes),
                FilterOutput::Pending => {}
                FilterOutput::CloseSession => return (forwarded, true),
            }
        }
        (forwarded, false)
    }

    #[test]
    fn tilde_dot_after_newline_closes_the_session() {
        let (forwarded, closed) = run_filter(b"a\n~.b");
        assert!(closed);
        assert_eq!(forwarded, b"a\n");
    }

    #[test]
    fn tilde_tilde_reemits_the_tilde() {
        let (forwarded, closed) = run_filter(b"a\n~~b");
        assert!(!closed);
        assert_eq!(forwarded, b"a\n~~b");
    }

    #[test]
    fn tilde_mid_line_is_forwarded() {
        let (forwarded, closed) = run_filter(b"a~.b");
        assert!(!closed);
        assert_eq!(forwarded, b"a~.b");
    }

    #[test]
    fn dot_without_escape_is_forwarded() {
        let (forwarded, closed) = run_filter(b"a.b\n.c");
        assert!(!closed);
        assert_eq!(forwarded, b"a.b\n.c");
    }

    #[test]
    fn carriage_return_also_arms_the_escape() {
        let (forwarded, closed) = run_filter(b"a\r~.");
        assert!(closed);
        assert_eq!(forwarded, b"a\r");
    }

    #[test]
    fn first_line_tilde_is_literal() {
        let (forwarded, closed) = run_filter(b"~.");
        assert!(!closed);
        assert_eq!(forwarded, b"~.");
    }

    #[test]
    fn armed_escape_followed_by_newline_rearms() {
        // `~` then Enter emits both and leaves us after a newline, so a
        // following `~.` still closes.
        let (forwarded, closed) = run_filter(b"\n~\n~.");
        assert!(closed);
        assert_eq!(forwarded, b"\n~\n");
    }

    #[test]
    fn terminal_restore_is_idempotent() {
        // Not a tty in the test environment; enter may fail, but restore
        // must be callable any number of times without erroring.
        if let Ok(mut guard) = RawModeGuard::enter() {
            guard.restore();
            guard.restore();
        }
        let mut guard = RawModeGuard { restored: true };
        guard.restore();
        guard.restore();
    }

    #[tokio::test]
    async fn input_relay_closes_remote_stdin_on_escape() {
        let input: &[u8] = b"hello\n~.ignored";
        let (ours, mut theirs) = tokio::io::duplex(256);

        input_relay(input, ours).await;

        let mut received = Vec::new();
        theirs.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello\n");
    }

    #[tokio::test]
    async fn input_relay_forwards_everything_on_plain_eof() {
        let input: &[u8] = b"plain text, no escapes";
        let (ours, mut theirs) = tokio::io::duplex(256);

        input_relay(input, ours).await;

        let mut received = Vec::new();
        theirs.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"plain text, no escapes");
    }
}
