//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DaemonError, DaemonResult};

/// Configuration for the dockhost daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the terminal bridge (e.g. 0.0.0.0:18800)
    pub bridge_addr: String,

    /// Path to persistent state directory
    pub state_path: PathBuf,

    /// Seconds between lifecycle sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Minutes of inactivity before a ready app is suspended
    #[serde(default = "default_suspend_after")]
    pub suspend_after_mins: i64,

    /// Minutes of inactivity before an app is hibernated
    #[serde(default = "default_hibernate_after")]
    pub hibernate_after_mins: i64,

    /// SSH connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Skip command validation entirely. Every command still lands in the
    /// audit log, tagged as bypassed.
    #[serde(default)]
    pub security_bypass: bool,

    /// Base commands the validator permits
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_suspend_after() -> i64 {
    20
}

fn default_hibernate_after() -> i64 {
    3 * 24 * 60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_whitelist() -> Vec<String> {
    [
        "ls", "cat", "pwd", "echo", "grep", "find", "head", "tail", "mkdir", "touch", "rm", "mv",
        "cp", "node", "npm", "npx", "git", "docker", "pkill", "pgrep", "ps", "df", "free",
        "apt-get", "curl", "sudo",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| DaemonError::Config(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> DaemonResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bridge_addr: "0.0.0.0:18800".to_string(),
            state_path: PathBuf::from("/var/lib/dockhost"),
            sweep_interval_secs: 300,
            suspend_after_mins: 20,
            hibernate_after_mins: 3 * 24 * 60,
            connect_timeout_secs: 10,
            security_bypass: false,
            whitelist: default_whitelist(),
        }
    }
}
