//! Streaming SSH transport for interactive sessions.
//!
//! [`SshStream`] runs one remote command and exposes its byte streams over
//! tokio channels. A dedicated blocking task owns the ssh2 session in
//! non-blocking mode and polls stdout, stderr, and queued client input until
//! either side goes away. Dropping the [`SshStream`] closes the sender, which
//! tells the pump to shut the channel down.

use crate::{SshTarget, TransportError, open_session};
use ssh2::Channel;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_BUF_SIZE: usize = 8192;

/// Whether the remote command gets a pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    /// Request a PTY before exec (interactive shells).
    Pty,
    /// Plain exec (log following, batch output).
    Plain,
}

/// A live remote command with streaming I/O.
pub struct SshStream {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
    stdin: mpsc::Sender<Vec<u8>>,
}

impl SshStream {
    /// Connect, start `command`, and hand back the stream handles.
    pub async fn open(
        target: &SshTarget,
        command: &str,
        mode: RemoteMode,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let target = target.clone();
        let command = command.to_string();

        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);

        // Establish the channel before returning so connection and auth
        // failures surface to the caller instead of dying in the pump.
        let (session, channel) = tokio::task::spawn_blocking(move || {
            let session = open_session(&target, connect_timeout)?;
            let mut channel = session
                .channel_session()
                .map_err(|e| TransportError::Channel(e.to_string()))?;

            if mode == RemoteMode::Pty {
                channel
                    .request_pty("xterm", None, None)
                    .map_err(|e| TransportError::Channel(e.to_string()))?;
            }

            channel
                .exec(&command)
                .map_err(|e| TransportError::Channel(e.to_string()))?;

            Ok::<_, TransportError>((session, channel))
        })
        .await
        .map_err(|e| TransportError::Channel(format!("transport task failed: {e}")))??;

        tokio::task::spawn_blocking(move || {
            pump(session, channel, stdout_tx, stderr_tx, stdin_rx);
        });

        Ok(Self {
            stdout: stdout_rx,
            stderr: stderr_rx,
            stdin: stdin_tx,
        })
    }

    /// Queue bytes for the remote stdin. Fails once the pump has shut down.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.stdin
            .send(bytes)
            .await
            .map_err(|_| TransportError::Channel("stream closed".to_string()))
    }

    /// A standalone handle for the remote stdin, usable while the stdout and
    /// stderr receivers are mutably borrowed elsewhere.
    pub fn writer(&self) -> mpsc::Sender<Vec<u8>> {
        self.stdin.clone()
    }
}

/// Drive the channel until the remote side finishes or the caller drops its
/// handles. Owns the session for the whole lifetime of the stream.
fn pump(
    session: ssh2::Session,
    mut channel: Channel,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
) {
    session.set_blocking(false);
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        let mut made_progress = false;

        // Remote stdout → channel
        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                made_progress = true;
                if stdout_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    debug!("stdout receiver dropped, closing stream");
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "stdout read error");
                break;
            }
        }

        // Remote stderr → channel
        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                made_progress = true;
                if stderr_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "stderr read error");
                break;
            }
        }

        // Queued client input → remote stdin
        match stdin_rx.try_recv() {
            Ok(bytes) => {
                made_progress = true;
                if let Err(e) = write_all_retrying(&mut channel, &bytes) {
                    warn!(error = %e, "stdin write error");
                    break;
                }
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("client side closed, sending eof");
                break;
            }
        }

        if channel.eof() {
            debug!("remote channel reached eof");
            break;
        }

        if !made_progress {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    session.set_blocking(true);
    let _ = channel.send_eof();
    let _ = channel.close();
    let _ = channel.wait_close();
    // Dropping the senders here ends the readers on the async side.
}

/// Non-blocking writes can accept partial buffers; retry until everything is
/// on the wire.
fn write_all_retrying(channel: &mut Channel, mut bytes: &[u8]) -> std::io::Result<()> {
    while !bytes.is_empty() {
        match channel.write(bytes) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "channel refused input",
                ));
            }
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
