//! Shared fixtures for dockhost integration tests.
//!
//! `FakeHost` plays the remote side of the SSH transport: scripted responses
//! keyed on command substrings, with every issued command recorded so tests
//! can assert on ordering and shape.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use dock_proto::{AppRecord, AppStatus, ExecOutput, HostRecord, HostStatus};
use dock_ssh::{CommandExecutor, SshTarget, TransportError};
use std::sync::Mutex;

// ─── Scripted remote host ─────────────────────────────────────────────────────

struct Rule {
    pattern: String,
    response: Result<ExecOutput, ()>,
}

/// A stand-in remote host. The first rule whose pattern is a substring of the
/// issued command or of the target endpoint decides the outcome; unmatched
/// commands exit cleanly.
#[derive(Default)]
pub struct FakeHost {
    rules: Vec<Rule>,
    issued: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` answer with the given output.
    pub fn on(mut self, pattern: &str, stdout: &str, stderr: &str, exit_code: i32) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            response: Ok(ExecOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            }),
        });
        self
    }

    /// Commands containing `pattern` fail at the transport layer.
    pub fn unreachable_for(mut self, pattern: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            response: Err(()),
        });
        self
    }

    /// Every command issued so far, in order.
    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().expect("lock").clone()
    }

    /// Position of the first issued command containing `pattern`.
    pub fn position_of(&self, pattern: &str) -> Option<usize> {
        self.issued().iter().position(|c| c.contains(pattern))
    }
}

#[async_trait]
impl CommandExecutor for FakeHost {
    async fn execute(
        &self,
        target: &SshTarget,
        command: &str,
    ) -> Result<ExecOutput, TransportError> {
        self.issued.lock().expect("lock").push(command.to_string());

        let endpoint = target.endpoint();
        for rule in &self.rules {
            if command.contains(&rule.pattern) || endpoint.contains(&rule.pattern) {
                return match &rule.response {
                    Ok(output) => Ok(output.clone()),
                    Err(()) => Err(TransportError::Connect(
                        target.endpoint(),
                        "connection refused".to_string(),
                    )),
                };
            }
        }

        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

// ─── Record builders ──────────────────────────────────────────────────────────

pub fn ready_host(host_id: &str, user_id: &str) -> HostRecord {
    HostRecord {
        host_id: host_id.to_string(),
        user_id: user_id.to_string(),
        address: "203.0.113.50".to_string(),
        ssh_port: 22,
        ssh_username: "root".to_string(),
        ssh_password: "secret".to_string(),
        status: HostStatus::Ready,
        created_at: Utc::now(),
    }
}

pub fn ready_app(app_id: &str, user_id: &str, server_id: &str, container_id: &str) -> AppRecord {
    AppRecord {
        app_id: app_id.to_string(),
        user_id: user_id.to_string(),
        name: format!("app-{app_id}"),
        server_id: Some(server_id.to_string()),
        container_id: Some(container_id.to_string()),
        status: AppStatus::Ready,
        last_activity_at: Utc::now(),
        created_at: Utc::now(),
    }
}

/// A ready app whose last activity is `idle_mins` minutes in the past.
pub fn idle_app(
    app_id: &str,
    user_id: &str,
    server_id: &str,
    container_id: &str,
    idle_mins: i64,
) -> AppRecord {
    let mut app = ready_app(app_id, user_id, server_id, container_id);
    app.last_activity_at = Utc::now() - chrono::Duration::minutes(idle_mins);
    app
}
