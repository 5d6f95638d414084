//! Scripted command execution against a running app container.
//!
//! Every command a user submits flows through here: resolve the app and its
//! host, gate it on the safety validator, record the decision in the audit
//! log, then run it inside the container with `/app` as the working
//! directory. The validator sees the user's command as written; the wrapping
//! happens only after the verdict.

use dock_audit::EventType;
use dock_guard::{self, Verdict};
use dock_proto::{AppRecord, ExecOutput, HostRecord, short_container_id};
use dock_ssh::{CommandExecutor, SshTarget};
use tracing::{info, warn};

use crate::SharedState;
use crate::error::{DaemonError, DaemonResult};

/// Wrap a user command so it runs inside the container from `/app`.
///
/// Double quotes in the command are escaped so the payload survives the
/// outer `bash -c "..."` shell.
pub fn wrap_app_command(container_id: &str, command: &str) -> String {
    let escaped = command.replace('"', "\\\"");
    format!("docker exec {container_id} bash -c \"cd /app && {escaped}\"")
}

/// Execute one whitelisted command inside an app's container.
///
/// A non-zero exit is `CommandFailed` with the captured output; a validator
/// denial is `CommandBlocked`. Both are recorded before any byte goes over
/// the wire.
pub async fn run_app_command<E: CommandExecutor>(
    state: &SharedState,
    executor: &E,
    user_id: &str,
    app_id: &str,
    command: &str,
) -> DaemonResult<ExecOutput> {
    let (app, host) = resolve_app(state, app_id).await?;
    let container_id = app
        .container_id
        .as_deref()
        .ok_or_else(|| DaemonError::MissingContainer(app_id.to_string()))?;
    let server_id = app.server_id.as_deref();

    // ── Validator gate ────────────────────────────────────────────────────
    if state.config.security_bypass {
        warn!(user = %user_id, app = %app_id, "security bypass active, skipping validation");
        state.stores.events.write().await.append(
            EventType::CommandSecurityBypassed,
            user_id,
            server_id,
            Some(app_id),
            "Command executed with security validation bypassed.",
            Some(command),
        );
    } else {
        match dock_guard::validate(command, &state.whitelist) {
            Verdict::Permitted => {
                state.stores.events.write().await.append(
                    EventType::CommandExecuted,
                    user_id,
                    server_id,
                    Some(app_id),
                    &format!(
                        "Command executed in container {}.",
                        short_container_id(container_id)
                    ),
                    Some(command),
                );
            }
            Verdict::Denied { reason } => {
                warn!(user = %user_id, app = %app_id, %reason, "command blocked");
                state.stores.events.write().await.append(
                    EventType::CommandBlocked,
                    user_id,
                    server_id,
                    Some(app_id),
                    &format!("Command blocked: {reason}"),
                    Some(command),
                );
                return Err(DaemonError::CommandBlocked {
                    command: command.to_string(),
                    reason,
                });
            }
        }
    }

    // ── Execute ───────────────────────────────────────────────────────────
    let target = SshTarget::from_host(&host);
    let wrapped = wrap_app_command(container_id, command);
    info!(app = %app_id, container = %short_container_id(container_id), "running command");

    let output = executor.execute(&target, &wrapped).await?;
    if output.ok() {
        Ok(output)
    } else {
        Err(DaemonError::CommandFailed {
            message: format!("command exited with status {}", output.exit_code),
            output: output.stdout,
            error: output.stderr,
        })
    }
}

async fn resolve_app(state: &SharedState, app_id: &str) -> DaemonResult<(AppRecord, HostRecord)> {
    let app = {
        let apps = state.stores.apps.read().await;
        apps.get(app_id)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownApp(app_id.to_string()))?
    };

    let server_id = app
        .server_id
        .clone()
        .ok_or_else(|| DaemonError::MissingContainer(app_id.to_string()))?;

    let host = {
        let hosts = state.stores.hosts.read().await;
        hosts
            .get(&server_id)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownHost(server_id.clone()))?
    };

    Ok((app, host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DaemonConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use dock_proto::{AppStatus, HostStatus};
    use dock_ssh::TransportError;
    use std::sync::Mutex;

    /// Records every command it is asked to run; answers with a fixed output.
    struct RecordingExecutor {
        commands: Mutex<Vec<String>>,
        exit_code: i32,
        stderr: String,
    }

    impl RecordingExecutor {
        fn clean() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                exit_code: 0,
                stderr: String::new(),
            }
        }

        fn failing(exit_code: i32, stderr: &str) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                exit_code,
                stderr: stderr.to_string(),
            }
        }

        fn seen(&self) -> Vec<String> {
            self.commands.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(
            &self,
            _target: &SshTarget,
            command: &str,
        ) -> Result<ExecOutput, TransportError> {
            self.commands.lock().expect("lock").push(command.to_string());
            Ok(ExecOutput {
                stdout: "ok".to_string(),
                stderr: self.stderr.clone(),
                exit_code: self.exit_code,
            })
        }
    }

    async fn seeded_state(dir: &std::path::Path, bypass: bool) -> SharedState {
        let config = DaemonConfig {
            state_path: dir.to_path_buf(),
            security_bypass: bypass,
            ..DaemonConfig::default()
        };
        let state = SharedState::new(config);

        state.stores.hosts.write().await.upsert(HostRecord {
            host_id: "srv-1".to_string(),
            user_id: "u-1".to_string(),
            address: "203.0.113.9".to_string(),
            ssh_port: 22,
            ssh_username: "root".to_string(),
            ssh_password: "pw".to_string(),
            status: HostStatus::Ready,
            created_at: Utc::now(),
        });
        state.stores.apps.write().await.upsert(AppRecord {
            app_id: "app-1".to_string(),
            user_id: "u-1".to_string(),
            name: "shop".to_string(),
            server_id: Some("srv-1".to_string()),
            container_id: Some("abc123def456789".to_string()),
            status: AppStatus::Ready,
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
        });
        state
    }

    #[test]
    fn test_wrap_escapes_double_quotes() {
        assert_eq!(
            wrap_app_command("abc123", "ls -la"),
            "docker exec abc123 bash -c \"cd /app && ls -la\""
        );
        assert_eq!(
            wrap_app_command("abc123", r#"echo "hi""#),
            "docker exec abc123 bash -c \"cd /app && echo \\\"hi\\\"\""
        );
    }

    #[tokio::test]
    async fn test_permitted_command_runs_wrapped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = seeded_state(dir.path(), false).await;
        let executor = RecordingExecutor::clean();

        let output = run_app_command(&state, &executor, "u-1", "app-1", "npm install")
            .await
            .expect("exec");
        assert!(output.ok());

        let seen = executor.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            "docker exec abc123def456789 bash -c \"cd /app && npm install\""
        );

        let events = state.stores.events.read().await;
        let log = events.query(None, Some("app-1"), Some(EventType::CommandExecuted), 10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].command.as_deref(), Some("npm install"));
    }

    #[tokio::test]
    async fn test_blocked_command_never_reaches_host() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = seeded_state(dir.path(), false).await;
        let executor = RecordingExecutor::clean();

        let err = run_app_command(&state, &executor, "u-1", "app-1", "rm -rf /etc")
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::CommandBlocked { .. }));
        assert!(executor.seen().is_empty());

        let events = state.stores.events.read().await;
        let log = events.query(None, Some("app-1"), Some(EventType::CommandBlocked), 10);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_bypass_skips_validation_but_still_audits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = seeded_state(dir.path(), true).await;
        let executor = RecordingExecutor::clean();

        // A command the validator would deny
        run_app_command(&state, &executor, "u-1", "app-1", "rm -rf /etc")
            .await
            .expect("bypass exec");
        assert_eq!(executor.seen().len(), 1);

        let events = state.stores.events.read().await;
        let log = events.query(
            None,
            Some("app-1"),
            Some(EventType::CommandSecurityBypassed),
            10,
        );
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = seeded_state(dir.path(), false).await;
        let executor = RecordingExecutor::failing(2, "no such file");

        let err = run_app_command(&state, &executor, "u-1", "app-1", "cat missing.txt")
            .await
            .unwrap_err();
        match err {
            DaemonError::CommandFailed { error, .. } => assert_eq!(error, "no such file"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_hibernated_app_has_no_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = seeded_state(dir.path(), false).await;
        state.stores.apps.write().await.upsert(AppRecord {
            app_id: "app-2".to_string(),
            user_id: "u-1".to_string(),
            name: "dormant".to_string(),
            server_id: None,
            container_id: None,
            status: AppStatus::Hibernated,
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
        });
        let executor = RecordingExecutor::clean();

        let err = run_app_command(&state, &executor, "u-1", "app-2", "ls")
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::MissingContainer(_)));
    }

    #[tokio::test]
    async fn test_unknown_app_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = seeded_state(dir.path(), false).await;
        let executor = RecordingExecutor::clean();

        let err = run_app_command(&state, &executor, "u-1", "ghost", "ls")
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::UnknownApp(_)));
    }
}
