//! Domain types for the dockhost app container fleet.
//!
//! Defines the records shared between the persistence layer, the lifecycle
//! controller, the session bridge, and the daemon: SSH hosts, user apps,
//! file backups, resource samples, and command output.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Host ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Pending,
    Ready,
    Failed,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A remote SSH host that runs app containers for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_id: String,
    pub user_id: String,
    pub address: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub ssh_password: String,
    pub status: HostStatus,
    pub created_at: DateTime<Utc>,
}

// ─── App ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Provisioning,
    Ready,
    Suspended,
    Hibernated,
    Deleting,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Suspended => write!(f, "suspended"),
            Self::Hibernated => write!(f, "hibernated"),
            Self::Deleting => write!(f, "deleting"),
        }
    }
}

/// A user application living inside one Docker container on one host.
///
/// `container_id` and `server_id` are both set while the app has a live
/// container (ready or suspended) and both cleared once it is hibernated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub app_id: String,
    pub user_id: String,
    pub name: String,
    pub server_id: Option<String>,
    pub container_id: Option<String>,
    pub status: AppStatus,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AppRecord {
    /// True if the record satisfies the container/host pairing rule for its
    /// status. Provisioning and deleting apps may be in either shape.
    pub fn runtime_ids_consistent(&self) -> bool {
        match self.status {
            AppStatus::Ready | AppStatus::Suspended => {
                self.container_id.is_some() && self.server_id.is_some()
            }
            AppStatus::Hibernated => self.container_id.is_none() && self.server_id.is_none(),
            AppStatus::Provisioning | AppStatus::Deleting => true,
        }
    }

    /// Minutes since the last recorded activity.
    pub fn idle_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity_at).num_minutes()
    }
}

// ─── Backups ──────────────────────────────────────────────────────────────────

/// One backed-up file from an app's `/app` tree, keyed on (app_id, path).
///
/// `file_path` is stored relative to `/app/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBackupRecord {
    pub app_id: String,
    pub user_id: String,
    pub file_path: String,
    pub file_content: String,
    pub size_bytes: u64,
    pub backed_up_at: DateTime<Utc>,
}

// ─── Resource samples ─────────────────────────────────────────────────────────

/// A point-in-time resource reading for one host. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub sample_id: String,
    pub server_id: String,
    pub user_id: String,
    pub cpu_usage_pct: f64,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    pub disk_usage_pct: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

// ─── Profiles ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
    SuperAdmin,
}

impl UserRole {
    /// Admins and super admins may reach hosts they do not own.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: String,
    pub role: UserRole,
}

// ─── Command output ───────────────────────────────────────────────────────────

/// Captured output of one remote command. A non-zero exit code is a normal
/// outcome here, not a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

// ─── Session mode ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Interactive shell inside the container (PTY, bidirectional).
    Shell,
    /// Follow container logs (no PTY, client input ignored).
    Logs,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell => write!(f, "shell"),
            Self::Logs => write!(f, "logs"),
        }
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Container id truncated for display, the way `docker ps` prints them.
pub fn short_container_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Validate an id used as a store key or container reference.
pub fn validate_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
