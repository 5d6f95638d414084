//! WebSocket bridge between browser terminals and container transports.
//!
//! Each incoming WebSocket connection names a host, a container, a user, and
//! a mode (`shell` or `logs`) in its query string. The bridge authorizes the
//! user against the host, opens a streaming SSH transport, and pumps bytes
//! both ways until either side closes:
//!
//! Connecting → Authorizing → EstablishingTransport → Streaming → Closed
//!
//! Server-originated diagnostics are injected into the terminal byte stream
//! as ANSI-colored `[SERVER]` / `[SERVER ERROR]` lines so they are visually
//! distinct from remote output. In `logs` mode client input is drained and
//! ignored.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use dock_audit::{EventLog, EventType};
use dock_persist::{HostStore, ProfileStore};
use dock_proto::{HostRecord, SessionMode, validate_id};
use dock_ssh::{RemoteMode, SshStream, SshTarget, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HandshakeRequest, Response as HandshakeResponse,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("missing or invalid parameter: {0}")]
    Params(String),

    #[error("access denied")]
    Unauthorized,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

// ─── Session lifecycle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorizing,
    EstablishingTransport,
    Streaming,
    Closed,
}

/// A streaming session as seen from outside the pump.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: Uuid,
    pub user_id: String,
    pub server_id: String,
    pub container_id: String,
    pub mode: SessionMode,
    pub opened_at: DateTime<Utc>,
}

/// Live sessions, keyed by server-generated id. Entries exist only while the
/// session is streaming.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: SessionEntry) {
        self.inner.write().await.insert(entry.session_id, entry);
    }

    pub async fn remove(&self, session_id: &Uuid) -> Option<SessionEntry> {
        self.inner.write().await.remove(session_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<SessionEntry> {
        self.inner.read().await.values().cloned().collect()
    }
}

// ─── Request parsing ──────────────────────────────────────────────────────────

/// What the client asked for, parsed from the upgrade request's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRequest {
    pub server_id: String,
    pub container_id: String,
    pub user_id: String,
    pub mode: SessionMode,
}

impl BridgeRequest {
    /// Parse `serverId`, `containerId`, `userId`, and optional `mode` from a
    /// request URI. Mode defaults to `shell`.
    pub fn from_uri(uri: &str) -> Result<Self, BridgeError> {
        // The upgrade request carries only path + query; give it a base.
        let url = Url::parse(&format!("ws://bridge{uri}"))
            .map_err(|e| BridgeError::Params(e.to_string()))?;

        let mut server_id = None;
        let mut container_id = None;
        let mut user_id = None;
        let mut mode = SessionMode::Shell;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "serverId" => server_id = Some(value.to_string()),
                "containerId" => container_id = Some(value.to_string()),
                "userId" => user_id = Some(value.to_string()),
                "mode" => {
                    mode = match value.as_ref() {
                        "logs" => SessionMode::Logs,
                        _ => SessionMode::Shell,
                    }
                }
                _ => {}
            }
        }

        // Ids are interpolated into remote command lines, so anything outside
        // the id alphabet is rejected here.
        Ok(Self {
            server_id: server_id
                .filter(|s| validate_id(s))
                .ok_or_else(|| BridgeError::Params("serverId".to_string()))?,
            container_id: container_id
                .filter(|s| validate_id(s))
                .ok_or_else(|| BridgeError::Params("containerId".to_string()))?,
            user_id: user_id
                .filter(|s| validate_id(s))
                .ok_or_else(|| BridgeError::Params("userId".to_string()))?,
            mode,
        })
    }

    /// The remote command and terminal mode this session runs.
    pub fn remote_command(&self) -> (String, RemoteMode) {
        match self.mode {
            SessionMode::Shell => (
                format!("docker exec -it {} /bin/bash", self.container_id),
                RemoteMode::Pty,
            ),
            SessionMode::Logs => (
                format!("docker logs -f --tail=200 {}", self.container_id),
                RemoteMode::Plain,
            ),
        }
    }
}

// ─── Terminal framing ─────────────────────────────────────────────────────────

/// Red diagnostic line from the bridge itself.
pub fn server_error_line(message: &str) -> String {
    format!("\x1b[31m[SERVER] {message}\x1b[0m\r\n")
}

/// Green status line from the bridge itself.
pub fn server_notice_line(message: &str) -> String {
    format!("\x1b[32m[SERVER] {message}\x1b[0m\r\n")
}

/// Remote stderr chunk, wrapped so it stands out from terminal output.
pub fn remote_stderr_line(chunk: &str) -> String {
    format!("\r\n\x1b[31m[SERVER ERROR] {chunk}\x1b[0m\r\n")
}

/// Client frames become remote stdin bytes only in shell mode. Logs sessions
/// and control frames produce nothing.
pub fn client_input(mode: SessionMode, message: &Message) -> Option<Vec<u8>> {
    if mode != SessionMode::Shell {
        return None;
    }
    match message {
        Message::Binary(bytes) => Some(bytes.clone()),
        Message::Text(text) => Some(text.as_bytes().to_vec()),
        _ => None,
    }
}

// ─── Bridge context ───────────────────────────────────────────────────────────

/// Shared dependencies for every connection the bridge accepts.
#[derive(Clone)]
pub struct BridgeContext {
    pub hosts: Arc<RwLock<HostStore>>,
    pub profiles: Arc<RwLock<ProfileStore>>,
    pub events: Arc<RwLock<EventLog>>,
    pub registry: SessionRegistry,
    pub connect_timeout: Duration,
}

/// Resolve the acting user's host access. Elevated roles reach any host;
/// everyone else only hosts they own.
pub async fn authorize(ctx: &BridgeContext, request: &BridgeRequest) -> Option<HostRecord> {
    let elevated = {
        let profiles = ctx.profiles.read().await;
        profiles
            .get(&request.user_id)
            .map(|p| p.role.is_elevated())
            .unwrap_or(false)
    };

    let hosts = ctx.hosts.read().await;
    let owner = (!elevated).then_some(request.user_id.as_str());
    hosts.get_scoped(&request.server_id, owner).cloned()
}

// ─── Listener ─────────────────────────────────────────────────────────────────

/// Accept connections forever, one task per session.
pub async fn serve(listener: TcpListener, ctx: BridgeContext) {
    info!(addr = ?listener.local_addr().ok(), "session bridge listening");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "incoming bridge connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        debug!(error = %e, "bridge connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, ctx: BridgeContext) -> Result<(), BridgeError> {
    let mut state = SessionState::Connecting;
    debug!(?state, "handshake starting");
    let mut uri = String::new();

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &HandshakeRequest, resp: HandshakeResponse| {
            uri = req.uri().to_string();
            Ok(resp)
        },
    )
    .await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // ── Parse parameters ──────────────────────────────────────────────────
    let request = match BridgeRequest::from_uri(&uri) {
        Ok(request) => request,
        Err(e) => {
            let _ = ws_tx
                .send(Message::Text(server_error_line(&format!(
                    "Connection rejected: {e}."
                ))))
                .await;
            let _ = ws_tx.close().await;
            return Err(e);
        }
    };

    // ── Authorize ─────────────────────────────────────────────────────────
    state = SessionState::Authorizing;
    debug!(?state, user = %request.user_id, server = %request.server_id, mode = %request.mode, "authorizing session");

    let Some(host) = authorize(&ctx, &request).await else {
        warn!(user = %request.user_id, server = %request.server_id, "session denied");
        let _ = ws_tx
            .send(Message::Text(server_error_line(
                "Server not found or access denied.",
            )))
            .await;
        let _ = ws_tx.close().await;
        return Err(BridgeError::Unauthorized);
    };

    // ── Establish transport ───────────────────────────────────────────────
    state = SessionState::EstablishingTransport;
    let target = SshTarget::from_host(&host);
    debug!(?state, endpoint = %target.endpoint(), "opening transport");
    let (command, remote_mode) = request.remote_command();

    let mut transport =
        match SshStream::open(&target, &command, remote_mode, ctx.connect_timeout).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, server = %request.server_id, "transport failed");
                let _ = ws_tx
                    .send(Message::Text(server_error_line(&format!(
                        "SSH connection failed: {e}"
                    ))))
                    .await;
                let _ = ws_tx.close().await;
                return Err(e.into());
            }
        };

    // ── Streaming ─────────────────────────────────────────────────────────
    state = SessionState::Streaming;
    debug!(?state, "transport established");
    let session_id = Uuid::new_v4();
    ctx.registry
        .insert(SessionEntry {
            session_id,
            user_id: request.user_id.clone(),
            server_id: request.server_id.clone(),
            container_id: request.container_id.clone(),
            mode: request.mode,
            opened_at: Utc::now(),
        })
        .await;
    ctx.events.write().await.append(
        EventType::SessionOpened,
        &request.user_id,
        Some(&request.server_id),
        None,
        &format!("Interactive {} session opened.", request.mode),
        None,
    );

    info!(%session_id, user = %request.user_id, mode = %request.mode, "session streaming");
    let _ = ws_tx
        .send(Message::Text(server_notice_line(
            "SSH connection established.",
        )))
        .await;

    let stdin = transport.writer();
    let mut stderr_open = true;
    loop {
        tokio::select! {
            out = transport.stdout.recv() => match out {
                Some(chunk) => {
                    if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                // Remote command finished; close the client side.
                None => break,
            },

            err = transport.stderr.recv(), if stderr_open => match err {
                Some(chunk) => {
                    let text = String::from_utf8_lossy(&chunk);
                    if ws_tx
                        .send(Message::Text(remote_stderr_line(&text)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => stderr_open = false,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(message)) => {
                    if let Some(bytes) = client_input(request.mode, &message)
                        && stdin.send(bytes).await.is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "client socket error");
                    break;
                }
            },
        }
    }

    // ── Close ─────────────────────────────────────────────────────────────
    // Registry removal is unconditional: whichever side ended the session,
    // the entry must not outlive it.
    state = SessionState::Closed;
    ctx.registry.remove(&session_id).await;
    ctx.events.write().await.append(
        EventType::SessionClosed,
        &request.user_id,
        Some(&request.server_id),
        None,
        &format!("Interactive {} session closed.", request.mode),
        None,
    );
    let _ = ws_tx.close().await;
    debug!(%session_id, ?state, "session closed");

    Ok(())
}
