//! SSH command execution for dockhost.
//!
//! One connection per call: connect, authenticate, exec, drain, close. The
//! executor distinguishes transport faults ([`TransportError`]) from commands
//! that ran and exited non-zero — the latter come back as a normal
//! [`ExecOutput`] with the exit code set.
//!
//! The blocking ssh2 session is always driven from `spawn_blocking` so async
//! callers never stall a runtime worker.

#![forbid(unsafe_code)]

pub mod stream;

use async_trait::async_trait;
use dock_proto::{ExecOutput, HostRecord};
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub use stream::{RemoteMode, SshStream};

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Infrastructure faults reaching or speaking to the remote host. A command
/// that runs and fails is NOT a transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("connection timed out to {0}")]
    Timeout(String),

    #[error("ssh handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed for {0}")]
    Auth(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Target ───────────────────────────────────────────────────────────────────

/// Connection details for one SSH host.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl SshTarget {
    pub fn from_host(host: &HostRecord) -> Self {
        Self {
            address: host.address.clone(),
            port: host.ssh_port,
            username: host.ssh_username.clone(),
            password: host.ssh_password.clone(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// ─── Executor seam ────────────────────────────────────────────────────────────

/// The seam between callers and the wire. The lifecycle controller and tests
/// substitute scripted implementations.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        target: &SshTarget,
        command: &str,
    ) -> Result<ExecOutput, TransportError>;
}

/// Real executor backed by ssh2. Stateless — every call opens and closes its
/// own session.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    pub connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn execute(
        &self,
        target: &SshTarget,
        command: &str,
    ) -> Result<ExecOutput, TransportError> {
        let target = target.clone();
        let command = command.to_string();
        let timeout = self.connect_timeout;

        tokio::task::spawn_blocking(move || exec_blocking(&target, &command, timeout))
            .await
            .map_err(|e| TransportError::Channel(format!("executor task failed: {e}")))?
    }
}

// ─── Blocking internals ───────────────────────────────────────────────────────

/// Open an authenticated session. Shared by the one-shot executor and the
/// streaming transport.
pub(crate) fn open_session(
    target: &SshTarget,
    connect_timeout: Duration,
) -> Result<Session, TransportError> {
    let endpoint = target.endpoint();

    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect(endpoint.clone(), e.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Connect(endpoint.clone(), "no address".to_string()))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut {
            TransportError::Timeout(endpoint.clone())
        } else {
            TransportError::Connect(endpoint.clone(), e.to_string())
        }
    })?;

    let mut session = Session::new().map_err(|e| TransportError::Handshake(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    session
        .userauth_password(&target.username, &target.password)
        .map_err(|_| TransportError::Auth(format!("{}@{}", target.username, endpoint)))?;

    Ok(session)
}

fn exec_blocking(
    target: &SshTarget,
    command: &str,
    connect_timeout: Duration,
) -> Result<ExecOutput, TransportError> {
    debug!(endpoint = %target.endpoint(), command, "executing remote command");

    let session = open_session(target, connect_timeout)?;

    let mut channel = session
        .channel_session()
        .map_err(|e| TransportError::Channel(e.to_string()))?;
    channel
        .exec(command)
        .map_err(|e| TransportError::Channel(e.to_string()))?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;

    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel
        .wait_close()
        .map_err(|e| TransportError::Channel(e.to_string()))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| TransportError::Channel(e.to_string()))?;

    debug!(exit_code, "remote command finished");

    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
    })
}

// ─── Stop semantics ───────────────────────────────────────────────────────────

/// Stopping a container that is already gone or already stopped counts as a
/// successful stop.
pub fn is_considered_stopped(output: &ExecOutput) -> bool {
    if output.ok() {
        return true;
    }
    let stderr = output.stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("is not running")
}
