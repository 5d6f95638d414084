//! Integration-style tests for dockhost.
//!
//! These tests simulate end-to-end flows across crates:
//! - Idle app → suspension → hibernation with file backups → restore
//! - Scripted execution through the validator gate and audit log
//! - Wake path with automatic service recovery
//! - Sweep isolation when one host is unreachable
//! - State surviving a daemon restart

use dock_audit::EventType;
use dock_lifecycle::{LifecycleController, LifecycleStores, LifecycleThresholds};
use dock_proto::{AppStatus, HostStatus};
use dock_ssh::SshTarget;
use dockhost_tests::{FakeHost, idle_app, ready_app, ready_host};
use std::sync::Arc;

fn thresholds() -> LifecycleThresholds {
    LifecycleThresholds {
        suspend_after_mins: 20,
        hibernate_after_mins: 3 * 24 * 60,
    }
}

// ─── Test 1: Full dormancy cycle — suspend, hibernate, restore ────────────────

#[tokio::test]
async fn test_idle_app_full_dormancy_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stores = LifecycleStores::new(dir.path());

    stores
        .hosts
        .write()
        .await
        .upsert(ready_host("srv-1", "u-1"));
    stores
        .apps
        .write()
        .await
        .upsert(idle_app("app-1", "u-1", "srv-1", "cafe001122334455", 45));

    let host = Arc::new(
        FakeHost::new()
            .on("Cpu(s)", "12.5\n", "", 0)
            .on("free -m", "512 2048\n", "", 0)
            .on("df -h", "43%\n", "", 0)
            .on("/proc/net/dev", "123456 78910\n", "", 0)
            .on("find /app -type f", "/app/package.json\n/app/src/index.js\n", "", 0)
            .on("cat \"/app/package.json\"", "{\"name\":\"shop\"}", "", 0)
            .on("cat \"/app/src/index.js\"", "console.log(1)\n", "", 0),
    );
    let controller = LifecycleController::new(host.clone(), stores.clone(), thresholds());

    // First sweep: stats collected, app only suspended (idle 45 min < 3 days)
    let summary = controller.run_sweep().await;
    assert_eq!(summary.stats_collected_for, 1);
    assert_eq!(summary.suspended, 1);
    assert_eq!(summary.hibernated, 0);

    {
        let apps = stores.apps.read().await;
        let app = apps.get("app-1").expect("app");
        assert_eq!(app.status, AppStatus::Suspended);
        assert!(app.container_id.is_some());
    }
    let sample = {
        let samples = stores.samples.read().await;
        samples.list_for_server("srv-1")[0].clone()
    };
    assert_eq!(sample.cpu_usage_pct, 12.5);
    assert_eq!(sample.memory_used_mib, 512);
    assert_eq!(sample.memory_total_mib, 2048);
    assert_eq!(sample.network_rx_bytes, 123456);

    // Push the idle clock past the hibernation threshold
    stores
        .apps
        .write()
        .await
        .transition("app-1", &[AppStatus::Suspended], |a| {
            a.last_activity_at = chrono::Utc::now() - chrono::Duration::days(4);
        })
        .expect("age app");

    let summary = controller.run_sweep().await;
    assert_eq!(summary.hibernated, 1);

    // Backups were captured before the container was destroyed
    let rm_pos = host.position_of("docker rm -f cafe001122334455").expect("rm issued");
    let cat_pos = host
        .position_of("cat \"/app/src/index.js\"")
        .expect("cat issued");
    assert!(cat_pos < rm_pos, "backup must complete before destruction");

    {
        let apps = stores.apps.read().await;
        let app = apps.get("app-1").expect("app");
        assert_eq!(app.status, AppStatus::Hibernated);
        assert!(app.container_id.is_none());
        assert!(app.server_id.is_none());
    }
    assert_eq!(stores.backups.read().await.list_for_app("app-1").len(), 2);

    // Restore into a freshly provisioned container
    let target = SshTarget::from_host(&ready_host("srv-1", "u-1"));
    let restored = controller
        .restore_from_backups("app-1", &target, "srv-1", "beef998877665544")
        .await
        .expect("restore");
    assert_eq!(restored, 2);

    {
        let apps = stores.apps.read().await;
        let app = apps.get("app-1").expect("app");
        assert_eq!(app.status, AppStatus::Ready);
        assert_eq!(app.container_id.as_deref(), Some("beef998877665544"));
    }

    // Every transition is on the audit chain, and the chain is intact
    let events = stores.events.read().await;
    assert_eq!(
        events
            .query(None, Some("app-1"), Some(EventType::AppSuspended), 10)
            .len(),
        1
    );
    assert_eq!(
        events
            .query(None, Some("app-1"), Some(EventType::AppHibernated), 10)
            .len(),
        1
    );
    assert_eq!(
        events
            .query(None, Some("app-1"), Some(EventType::AppRestored), 10)
            .len(),
        1
    );
    assert!(events.verify_chain());
}

// ─── Test 2: Scripted execution through the validator gate ────────────────────

#[tokio::test]
async fn test_exec_gate_blocks_and_permits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dockhostd::DaemonConfig {
        state_path: dir.path().to_path_buf(),
        ..dockhostd::DaemonConfig::default()
    };
    let state = dockhostd::create_state(config);

    state
        .stores
        .hosts
        .write()
        .await
        .upsert(ready_host("srv-1", "u-1"));
    state
        .stores
        .apps
        .write()
        .await
        .upsert(ready_app("app-1", "u-1", "srv-1", "cafe001122334455"));

    let host = FakeHost::new().on("npm run build", "built\n", "", 0);

    // Permitted command is wrapped and executed
    let output = dockhostd::exec::run_app_command(&state, &host, "u-1", "app-1", "npm run build")
        .await
        .expect("exec");
    assert_eq!(output.stdout, "built\n");
    assert_eq!(
        host.issued()[0],
        "docker exec cafe001122334455 bash -c \"cd /app && npm run build\""
    );

    // Blocked command never reaches the host
    let err = dockhostd::exec::run_app_command(&state, &host, "u-1", "app-1", "rm -rf /etc/passwd")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("blocked"));
    assert_eq!(host.issued().len(), 1);

    let events = state.stores.events.read().await;
    assert_eq!(
        events
            .query(Some("u-1"), None, Some(EventType::CommandExecuted), 10)
            .len(),
        1
    );
    assert_eq!(
        events
            .query(Some("u-1"), None, Some(EventType::CommandBlocked), 10)
            .len(),
        1
    );
    assert!(events.verify_chain());
}

// ─── Test 3: Wake path with automatic service recovery ────────────────────────

#[tokio::test]
async fn test_wake_suspended_app_recovers_services() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stores = LifecycleStores::new(dir.path());

    stores
        .hosts
        .write()
        .await
        .upsert(ready_host("srv-1", "u-1"));
    let mut app = ready_app("app-1", "u-1", "srv-1", "cafe001122334455");
    app.status = AppStatus::Suspended;
    stores.apps.write().await.upsert(app);

    // Dev server is not running after the container starts
    let host = Arc::new(FakeHost::new().on("pgrep -f", "", "", 1));
    let controller = LifecycleController::new(host.clone(), stores.clone(), thresholds());

    let woken = controller.wake_app("app-1").await.expect("wake");
    assert_eq!(woken.status, AppStatus::Ready);

    let start_pos = host.position_of("docker start").expect("start issued");
    let install_pos = host.position_of("npm install").expect("install issued");
    let relaunch_pos = host.position_of("nohup npm run dev").expect("relaunch issued");
    assert!(start_pos < install_pos && install_pos < relaunch_pos);

    let events = stores.events.read().await;
    assert_eq!(
        events
            .query(None, Some("app-1"), Some(EventType::AppRecoveryStarted), 10)
            .len(),
        1
    );
    assert_eq!(
        events
            .query(
                None,
                Some("app-1"),
                Some(EventType::AppRecoverySucceeded),
                10
            )
            .len(),
        1
    );
    assert_eq!(
        events
            .query(None, Some("app-1"), Some(EventType::AppWoken), 10)
            .len(),
        1
    );
}

// ─── Test 4: One unreachable host does not poison the sweep ───────────────────

#[tokio::test]
async fn test_sweep_isolates_unreachable_host() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stores = LifecycleStores::new(dir.path());

    stores
        .hosts
        .write()
        .await
        .upsert(ready_host("srv-good", "u-1"));
    let mut bad = ready_host("srv-bad", "u-2");
    bad.address = "203.0.113.99".to_string();
    stores.hosts.write().await.upsert(bad);

    stores
        .apps
        .write()
        .await
        .upsert(idle_app("app-bad", "u-2", "srv-bad", "dead001122334455", 45));

    // Everything aimed at the bad host fails at the transport layer
    let host = Arc::new(
        FakeHost::new()
            .unreachable_for("203.0.113.99")
            .on("Cpu(s)", "5.0\n", "", 0),
    );
    let controller = LifecycleController::new(host, stores.clone(), thresholds());

    let summary = controller.run_sweep().await;
    assert_eq!(summary.stats_collected_for, 1);
    assert_eq!(summary.suspended, 0);

    let apps = stores.apps.read().await;
    let app = apps.get("app-bad").expect("app");
    assert_eq!(app.status, AppStatus::Ready, "failed suspend leaves app untouched");
}

// ─── Test 5: State survives a daemon restart ──────────────────────────────────

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let stores = LifecycleStores::new(dir.path());
        stores
            .hosts
            .write()
            .await
            .upsert(ready_host("srv-1", "u-1"));
        stores
            .apps
            .write()
            .await
            .upsert(ready_app("app-1", "u-1", "srv-1", "cafe001122334455"));
        stores.events.write().await.append(
            EventType::CommandExecuted,
            "u-1",
            Some("srv-1"),
            Some("app-1"),
            "Command executed in container cafe00112233.",
            Some("ls"),
        );
    }

    // Fresh handles over the same state directory
    let stores = LifecycleStores::new(dir.path());
    assert_eq!(
        stores
            .hosts
            .read()
            .await
            .list_by_status(HostStatus::Ready)
            .len(),
        1
    );
    let apps = stores.apps.read().await;
    let app = apps.get("app-1").expect("app survived");
    assert_eq!(app.container_id.as_deref(), Some("cafe001122334455"));

    let events = stores.events.read().await;
    assert_eq!(events.len(), 1);
    assert!(events.verify_chain());

    // The chain continues across the restart
    drop(apps);
    drop(events);
    stores.events.write().await.append(
        EventType::CommandExecuted,
        "u-1",
        Some("srv-1"),
        Some("app-1"),
        "Command executed in container cafe00112233.",
        Some("pwd"),
    );
    assert!(stores.events.read().await.verify_chain());
}
