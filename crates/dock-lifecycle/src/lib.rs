//! Application lifecycle control for dockhost.
//!
//! Periodic reconciliation over the fleet, three passes per sweep:
//!
//! 1. **Stats** — sample CPU, memory, disk, and network counters from every
//!    ready host and append a [`ResourceSample`].
//! 2. **Hibernation** — apps idle past the hibernate threshold get their
//!    `/app` tree backed up file by file, then their container destroyed and
//!    the record moved to `hibernated`. Backup strictly precedes destruction.
//! 3. **Suspension** — ready apps idle past the suspend threshold get their
//!    container stopped and the record moved to `suspended`.
//!
//! A failure on one host or app is logged and skipped; the batch continues.
//! The controller also owns the wake, service-recovery, and restore paths
//! used when a user returns to a dormant app.

#![forbid(unsafe_code)]

pub mod parse;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use dock_audit::{EventLog, EventType};
use dock_persist::{AppStore, BackupStore, HostStore, SampleStore, StoreError};
use dock_proto::{
    AppRecord, AppStatus, FileBackupRecord, HostStatus, ResourceSample, short_container_id,
};
use dock_ssh::{CommandExecutor, SshTarget, TransportError, is_considered_stopped};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

// ─── Stat snippets ────────────────────────────────────────────────────────────

const CPU_CMD: &str = r#"LC_ALL=C top -bn1 | grep "Cpu(s)" | sed "s/.*, *\([0-9.]*\)%* id.*/\1/" | awk '{print 100 - $1}'"#;
const MEM_CMD: &str = "LC_ALL=C free -m | awk '/^Mem:/{print $3, $2}'";
const DISK_CMD: &str = "LC_ALL=C df -h / | awk 'NR==2{print $5}'";
const NET_CMD: &str =
    "LC_ALL=C cat /proc/net/dev | awk 'NR>2 && $1 !~ /lo/ {rx+=$2; tx+=$10} END {print rx, tx}'";

const DEV_SERVER_PATTERN: &str = "npm run dev";

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("app {0} has no host assigned")]
    MissingHost(String),

    #[error("app {0} has no container assigned")]
    MissingContainer(String),

    #[error("host {0} not found")]
    UnknownHost(String),

    #[error("app {app_id} is {status} and cannot be woken")]
    NotWakeable { app_id: String, status: String },

    #[error("remote command failed: {command}: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

// ─── Thresholds & summary ─────────────────────────────────────────────────────

/// Idle cutoffs for the dormancy passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleThresholds {
    /// Minutes of inactivity before a ready app is suspended.
    pub suspend_after_mins: i64,
    /// Minutes of inactivity before a ready or suspended app is hibernated.
    pub hibernate_after_mins: i64,
}

impl Default for LifecycleThresholds {
    fn default() -> Self {
        Self {
            suspend_after_mins: 20,
            hibernate_after_mins: 3 * 24 * 60,
        }
    }
}

/// What one sweep accomplished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub stats_collected_for: u32,
    pub hibernated: u32,
    pub suspended: u32,
    pub swept_at: DateTime<Utc>,
}

// ─── Stores handle ────────────────────────────────────────────────────────────

/// Shared store handles the controller operates on.
#[derive(Clone)]
pub struct LifecycleStores {
    pub hosts: Arc<RwLock<HostStore>>,
    pub apps: Arc<RwLock<AppStore>>,
    pub backups: Arc<RwLock<BackupStore>>,
    pub samples: Arc<RwLock<SampleStore>>,
    pub events: Arc<RwLock<EventLog>>,
}

impl LifecycleStores {
    pub fn new(state_path: &std::path::Path) -> Self {
        Self {
            hosts: Arc::new(RwLock::new(HostStore::new(state_path))),
            apps: Arc::new(RwLock::new(AppStore::new(state_path))),
            backups: Arc::new(RwLock::new(BackupStore::new(state_path))),
            samples: Arc::new(RwLock::new(SampleStore::new(state_path))),
            events: Arc::new(RwLock::new(EventLog::new(state_path))),
        }
    }
}

// ─── Controller ───────────────────────────────────────────────────────────────

pub struct LifecycleController<E: CommandExecutor> {
    executor: Arc<E>,
    stores: LifecycleStores,
    thresholds: LifecycleThresholds,
}

impl<E: CommandExecutor> LifecycleController<E> {
    pub fn new(executor: Arc<E>, stores: LifecycleStores, thresholds: LifecycleThresholds) -> Self {
        Self {
            executor,
            stores,
            thresholds,
        }
    }

    /// Run the three passes. Per-item failures are logged and skipped, so the
    /// summary reflects what actually happened, not what was attempted.
    pub async fn run_sweep(&self) -> SweepSummary {
        let stats_collected_for = self.stats_pass().await;
        let hibernated = self.hibernate_pass().await;
        let suspended = self.suspend_pass().await;

        let summary = SweepSummary {
            stats_collected_for,
            hibernated,
            suspended,
            swept_at: Utc::now(),
        };
        info!(
            stats = summary.stats_collected_for,
            hibernated = summary.hibernated,
            suspended = summary.suspended,
            "sweep complete"
        );
        summary
    }

    // ─── Stats pass ───────────────────────────────────────────────────────

    async fn stats_pass(&self) -> u32 {
        let hosts: Vec<_> = {
            let store = self.stores.hosts.read().await;
            store
                .list_by_status(HostStatus::Ready)
                .into_iter()
                .cloned()
                .collect()
        };

        let mut collected = 0u32;
        for host in hosts {
            match self.sample_host(&host).await {
                Ok(sample) => {
                    self.stores.samples.write().await.append(sample);
                    self.stores.events.write().await.append(
                        EventType::StatsCollected,
                        &host.user_id,
                        Some(&host.host_id),
                        None,
                        "Resource sample collected.",
                        None,
                    );
                    collected += 1;
                }
                Err(e) => {
                    warn!(host = %host.host_id, error = %e, "stats collection failed");
                }
            }
        }
        collected
    }

    async fn sample_host(
        &self,
        host: &dock_proto::HostRecord,
    ) -> LifecycleResult<ResourceSample> {
        let target = SshTarget::from_host(host);

        let cpu = self.executor.execute(&target, CPU_CMD).await?;
        let mem = self.executor.execute(&target, MEM_CMD).await?;
        let disk = self.executor.execute(&target, DISK_CMD).await?;
        let net = self.executor.execute(&target, NET_CMD).await?;

        let (rx, tx) = parse::parse_net_bytes(&net.stdout);
        let (mem_used, mem_total) = parse::parse_memory_mib(&mem.stdout);
        Ok(ResourceSample {
            sample_id: String::new(),
            server_id: host.host_id.clone(),
            user_id: host.user_id.clone(),
            cpu_usage_pct: parse::parse_cpu_pct(&cpu.stdout),
            memory_used_mib: mem_used,
            memory_total_mib: mem_total,
            disk_usage_pct: parse::parse_disk_pct(&disk.stdout),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            sampled_at: Utc::now(),
        })
    }

    // ─── Hibernation pass ─────────────────────────────────────────────────

    async fn hibernate_pass(&self) -> u32 {
        let candidates = {
            let store = self.stores.apps.read().await;
            store.list_idle(
                &[AppStatus::Ready, AppStatus::Suspended],
                self.thresholds.hibernate_after_mins,
            )
        };

        let mut hibernated = 0u32;
        for app in candidates {
            match self.hibernate_app(&app).await {
                Ok(()) => {
                    hibernated += 1;
                    info!(app = %app.app_id, "hibernated");
                }
                Err(e) => {
                    warn!(app = %app.app_id, error = %e, "hibernation failed");
                }
            }
        }
        hibernated
    }

    async fn hibernate_app(&self, app: &AppRecord) -> LifecycleResult<()> {
        let (target, container_id) = self.resolve_runtime(app).await?;

        // Back up the whole /app tree first. Destruction only happens once
        // every file is safely stored.
        let listing = self
            .executor
            .execute(&target, &format!("docker exec {container_id} find /app -type f"))
            .await?;

        let mut backups = Vec::new();
        for path in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let content = self
                .executor
                .execute(&target, &format!("docker exec {container_id} cat \"{path}\""))
                .await?;
            backups.push(FileBackupRecord {
                app_id: app.app_id.clone(),
                user_id: app.user_id.clone(),
                file_path: path.strip_prefix("/app/").unwrap_or(path).to_string(),
                size_bytes: content.stdout.len() as u64,
                file_content: content.stdout,
                backed_up_at: Utc::now(),
            });
        }
        if !backups.is_empty() {
            self.stores.backups.write().await.upsert_batch(backups);
        }

        self.executor
            .execute(&target, &format!("docker rm -f {container_id}"))
            .await?;

        self.stores.apps.write().await.transition(
            &app.app_id,
            &[AppStatus::Ready, AppStatus::Suspended],
            |a| {
                a.status = AppStatus::Hibernated;
                a.container_id = None;
                a.server_id = None;
            },
        )?;

        self.stores.events.write().await.append(
            EventType::AppHibernated,
            &app.user_id,
            app.server_id.as_deref(),
            Some(&app.app_id),
            &format!(
                "Container {} archived and removed after extended inactivity.",
                short_container_id(&container_id)
            ),
            None,
        );
        Ok(())
    }

    // ─── Suspension pass ──────────────────────────────────────────────────

    async fn suspend_pass(&self) -> u32 {
        let candidates = {
            let store = self.stores.apps.read().await;
            store.list_idle(&[AppStatus::Ready], self.thresholds.suspend_after_mins)
        };

        let mut suspended = 0u32;
        for app in candidates {
            match self.suspend_app(&app).await {
                Ok(()) => {
                    suspended += 1;
                    info!(app = %app.app_id, "suspended");
                }
                Err(e) => {
                    warn!(app = %app.app_id, error = %e, "suspension failed");
                }
            }
        }
        suspended
    }

    async fn suspend_app(&self, app: &AppRecord) -> LifecycleResult<()> {
        let (target, container_id) = self.resolve_runtime(app).await?;

        let command = format!("docker stop {container_id}");
        let output = self.executor.execute(&target, &command).await?;

        // A container that is already gone or already stopped is a
        // successful stop.
        if !is_considered_stopped(&output) {
            return Err(LifecycleError::CommandFailed {
                command,
                stderr: output.stderr,
            });
        }

        self.stores
            .apps
            .write()
            .await
            .transition(&app.app_id, &[AppStatus::Ready], |a| {
                a.status = AppStatus::Suspended;
            })?;

        self.stores.events.write().await.append(
            EventType::AppSuspended,
            &app.user_id,
            app.server_id.as_deref(),
            Some(&app.app_id),
            &format!(
                "Container {} stopped after inactivity.",
                short_container_id(&container_id)
            ),
            None,
        );
        Ok(())
    }

    // ─── Wake path ────────────────────────────────────────────────────────

    /// Bring a suspended app back to ready, or verify a ready app's services.
    /// Either way the activity clock restarts.
    pub async fn wake_app(&self, app_id: &str) -> LifecycleResult<AppRecord> {
        let app = {
            let store = self.stores.apps.read().await;
            store
                .get(app_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(app_id.to_string()))?
        };

        match app.status {
            AppStatus::Suspended => {
                let (target, container_id) = self.resolve_runtime(&app).await?;
                self.executor
                    .execute(&target, &format!("docker start {container_id}"))
                    .await?;

                self.stores
                    .apps
                    .write()
                    .await
                    .transition(&app.app_id, &[AppStatus::Suspended], |a| {
                        a.status = AppStatus::Ready;
                    })?;

                self.ensure_services_running(&target, &app, &container_id)
                    .await?;

                self.stores.events.write().await.append(
                    EventType::AppWoken,
                    &app.user_id,
                    app.server_id.as_deref(),
                    Some(&app.app_id),
                    &format!(
                        "Container {} started on user return.",
                        short_container_id(&container_id)
                    ),
                    None,
                );
            }
            AppStatus::Ready => {
                let (target, container_id) = self.resolve_runtime(&app).await?;
                self.ensure_services_running(&target, &app, &container_id)
                    .await?;
            }
            status => {
                return Err(LifecycleError::NotWakeable {
                    app_id: app.app_id.clone(),
                    status: status.to_string(),
                });
            }
        }

        Ok(self.stores.apps.write().await.touch_activity(app_id)?)
    }

    /// Health-check the dev server inside the container; if it is gone,
    /// reinstall dependencies and relaunch it in the background.
    pub async fn ensure_services_running(
        &self,
        target: &SshTarget,
        app: &AppRecord,
        container_id: &str,
    ) -> LifecycleResult<()> {
        let check = self
            .executor
            .execute(
                target,
                &format!("docker exec {container_id} pgrep -f \"{DEV_SERVER_PATTERN}\""),
            )
            .await?;
        if check.ok() {
            return Ok(());
        }

        let short = short_container_id(container_id);
        info!(app = %app.app_id, container = %short, "services not running, starting recovery");
        self.stores.events.write().await.append(
            EventType::AppRecoveryStarted,
            &app.user_id,
            app.server_id.as_deref(),
            Some(&app.app_id),
            &format!("Services in container {short} not detected. Starting automatic recovery."),
            None,
        );

        self.executor
            .execute(
                target,
                &format!("docker exec {container_id} bash -c \"cd /app && npm install\""),
            )
            .await?;

        let kill_app = format!("pkill -f '{DEV_SERVER_PATTERN}' || true");
        let kill_tunnel = "pkill cloudflared || true";
        let relaunch = "nohup npm run dev -- --hostname 0.0.0.0 -p 3000 > /app/dev.log 2>&1";
        let shell = format!("{kill_app}; {kill_tunnel}; cd /app && ({relaunch}) &");
        let restart = self
            .executor
            .execute(
                target,
                &format!("docker exec {container_id} bash -c \"{shell}\""),
            )
            .await?;

        let stderr = restart.stderr.to_lowercase();
        if !restart.ok() && !restart.stderr.is_empty() && !stderr.contains("no process found") {
            warn!(app = %app.app_id, stderr = %restart.stderr, "service recovery failed");
            self.stores.events.write().await.append(
                EventType::AppRecoveryFailed,
                &app.user_id,
                app.server_id.as_deref(),
                Some(&app.app_id),
                &format!(
                    "Automatic recovery failed for container {short}. Error: {}",
                    restart.stderr
                ),
                None,
            );
            return Err(LifecycleError::CommandFailed {
                command: "service restart".to_string(),
                stderr: restart.stderr,
            });
        }

        info!(app = %app.app_id, container = %short, "services recovered");
        self.stores.events.write().await.append(
            EventType::AppRecoverySucceeded,
            &app.user_id,
            app.server_id.as_deref(),
            Some(&app.app_id),
            &format!("Services recovered for container {short}."),
            None,
        );
        Ok(())
    }

    // ─── Restore path ─────────────────────────────────────────────────────

    /// Replay a hibernated app's file backups into a freshly provisioned
    /// container, then mark it ready on its new host. Provisioning the
    /// container itself is the caller's concern.
    pub async fn restore_from_backups(
        &self,
        app_id: &str,
        target: &SshTarget,
        server_id: &str,
        container_id: &str,
    ) -> LifecycleResult<u32> {
        let backups: Vec<FileBackupRecord> = {
            let store = self.stores.backups.read().await;
            store.list_for_app(app_id).into_iter().cloned().collect()
        };

        let mut restored = 0u32;
        for backup in &backups {
            let encoded = BASE64.encode(backup.file_content.as_bytes());
            let shell = format!(
                "mkdir -p /app/$(dirname '{path}') && echo '{encoded}' | base64 -d > /app/{path}",
                path = backup.file_path
            );
            self.executor
                .execute(
                    target,
                    &format!("docker exec {container_id} bash -c \"{shell}\""),
                )
                .await?;
            restored += 1;
        }

        let user_id = {
            let mut apps = self.stores.apps.write().await;
            let updated = apps.transition(app_id, &[AppStatus::Hibernated], |a| {
                a.status = AppStatus::Ready;
                a.server_id = Some(server_id.to_string());
                a.container_id = Some(container_id.to_string());
                a.last_activity_at = Utc::now();
            })?;
            updated.user_id
        };

        self.stores.events.write().await.append(
            EventType::AppRestored,
            &user_id,
            Some(server_id),
            Some(app_id),
            &format!(
                "Restored {restored} files into container {}.",
                short_container_id(container_id)
            ),
            None,
        );
        Ok(restored)
    }

    /// Restart the idle clock for an app.
    pub async fn touch_activity(&self, app_id: &str) -> LifecycleResult<AppRecord> {
        Ok(self.stores.apps.write().await.touch_activity(app_id)?)
    }

    // ─── Helpers ──────────────────────────────────────────────────────────

    /// Resolve an app's host into an SSH target plus its container id.
    async fn resolve_runtime(&self, app: &AppRecord) -> LifecycleResult<(SshTarget, String)> {
        let server_id = app
            .server_id
            .as_deref()
            .ok_or_else(|| LifecycleError::MissingHost(app.app_id.clone()))?;
        let container_id = app
            .container_id
            .clone()
            .ok_or_else(|| LifecycleError::MissingContainer(app.app_id.clone()))?;

        let hosts = self.stores.hosts.read().await;
        let host = hosts
            .get(server_id)
            .ok_or_else(|| LifecycleError::UnknownHost(server_id.to_string()))?;
        Ok((SshTarget::from_host(host), container_id))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
