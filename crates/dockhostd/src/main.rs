//! dockhostd — dockhost daemon
//!
//! Supervises per-user app containers on remote SSH hosts: terminal bridge,
//! scripted command execution, and periodic lifecycle sweeps.

use chrono::Utc;
use clap::{Parser, Subcommand};
use dock_lifecycle::LifecycleController;
use dock_proto::{AppRecord, AppStatus, HostRecord, HostStatus, validate_id};
use dock_ssh::SshExecutor;
use dockhostd::{DaemonConfig, create_state, exec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dockhostd")]
#[command(about = "dockhost app container daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (terminal bridge + lifecycle sweep scheduler)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/dockhost/config.json")]
        config: PathBuf,
    },

    /// Run one lifecycle sweep and print the summary as JSON
    Sweep {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/dockhost/config.json")]
        config: PathBuf,
    },

    /// Execute a whitelisted command inside an app's container
    Exec {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/dockhost/config.json")]
        config: PathBuf,

        /// Acting user id
        #[arg(long)]
        user: String,

        /// Target app id
        #[arg(long)]
        app: String,

        /// The command to run (as the user typed it)
        command: String,
    },

    /// Register an SSH host
    HostAdd {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/dockhost/config.json")]
        config: PathBuf,

        /// Owning user id
        #[arg(long)]
        user: String,

        /// Host address (IP or DNS name)
        #[arg(long)]
        address: String,

        /// SSH port
        #[arg(long, default_value_t = 22)]
        port: u16,

        /// SSH username
        #[arg(long, default_value = "root")]
        username: String,

        /// SSH password
        #[arg(long)]
        password: String,
    },

    /// Register an app container on an existing host
    AppAdd {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/dockhost/config.json")]
        config: PathBuf,

        /// Owning user id
        #[arg(long)]
        user: String,

        /// App display name
        #[arg(long)]
        name: String,

        /// Host id the container runs on
        #[arg(long)]
        server: String,

        /// Docker container id
        #[arg(long)]
        container: String,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/dockhost/config.json")]
        output: PathBuf,
    },

    /// Show daemon and fleet information
    Info {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/dockhost/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Suppress tracing for exec/sweep to keep stdout clean JSON
    if !matches!(cli.command, Commands::Exec { .. } | Commands::Sweep { .. }) {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env().add_directive("dockhostd=info".parse()?))
            .init();
    }

    match cli.command {
        Commands::Run { config } => {
            run_daemon(config).await?;
        }
        Commands::Sweep { config } => {
            run_sweep_once(config).await?;
        }
        Commands::Exec {
            config,
            user,
            app,
            command,
        } => {
            exec_command(config, &user, &app, &command).await?;
        }
        Commands::HostAdd {
            config,
            user,
            address,
            port,
            username,
            password,
        } => {
            host_add(config, user, address, port, username, password).await?;
        }
        Commands::AppAdd {
            config,
            user,
            name,
            server,
            container,
        } => {
            app_add(config, user, name, server, container).await?;
        }
        Commands::InitConfig { output } => {
            init_config(output)?;
        }
        Commands::Info { config } => {
            fleet_info(config).await?;
        }
    }

    Ok(())
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_daemon(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting dockhostd");

    let config = DaemonConfig::load(&config_path)?;
    info!(
        bridge = %config.bridge_addr,
        state = %config.state_path.display(),
        sweep_interval = config.sweep_interval_secs,
        bypass = config.security_bypass,
        "loaded config"
    );

    let state = create_state(config.clone());
    let executor = Arc::new(SshExecutor::new(state.connect_timeout()));

    // Terminal bridge
    let listener = tokio::net::TcpListener::bind(&config.bridge_addr).await?;
    let bridge_ctx = state.bridge_context();
    tokio::spawn(dock_bridge::serve(listener, bridge_ctx));

    // Sweep scheduler. A failed pass is logged, never fatal.
    let controller =
        LifecycleController::new(executor, state.stores.clone(), state.thresholds());
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(config.sweep_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let summary = controller.run_sweep().await;
        info!(
            stats = summary.stats_collected_for,
            suspended = summary.suspended,
            hibernated = summary.hibernated,
            "sweep complete"
        );
    }
}

// ─── Sweep ───────────────────────────────────────────────────────────────────

async fn run_sweep_once(config_path: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let state = create_state(config);
    let executor = Arc::new(SshExecutor::new(state.connect_timeout()));

    let controller =
        LifecycleController::new(executor, state.stores.clone(), state.thresholds());
    let summary = controller.run_sweep().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// ─── Exec ────────────────────────────────────────────────────────────────────

async fn exec_command(
    config_path: PathBuf,
    user: &str,
    app: &str,
    command: &str,
) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let state = create_state(config);
    let executor = SshExecutor::new(state.connect_timeout());

    match exec::run_app_command(&state, &executor, user, app, command).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Err(e) => {
            let err = serde_json::json!({
                "ok": false,
                "error": e.to_string(),
                "command": command,
            });
            println!("{}", serde_json::to_string_pretty(&err)?);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ─── Seeding ─────────────────────────────────────────────────────────────────

async fn host_add(
    config_path: PathBuf,
    user: String,
    address: String,
    port: u16,
    username: String,
    password: String,
) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let state = create_state(config);

    let record = HostRecord {
        host_id: Uuid::new_v4().to_string(),
        user_id: user,
        address,
        ssh_port: port,
        ssh_username: username,
        ssh_password: password,
        status: HostStatus::Ready,
        created_at: Utc::now(),
    };
    let host_id = record.host_id.clone();
    state.stores.hosts.write().await.upsert(record);

    println!("Host registered: {host_id}");
    Ok(())
}

async fn app_add(
    config_path: PathBuf,
    user: String,
    name: String,
    server: String,
    container: String,
) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let state = create_state(config);

    if !validate_id(&container) {
        anyhow::bail!("container id may only contain [A-Za-z0-9_-]");
    }
    if state.stores.hosts.read().await.get(&server).is_none() {
        anyhow::bail!("host {server} not found");
    }

    let record = AppRecord {
        app_id: Uuid::new_v4().to_string(),
        user_id: user,
        name,
        server_id: Some(server),
        container_id: Some(container),
        status: AppStatus::Ready,
        last_activity_at: Utc::now(),
        created_at: Utc::now(),
    };
    let app_id = record.app_id.clone();
    state.stores.apps.write().await.upsert(record);

    println!("App registered: {app_id}");
    Ok(())
}

// ─── InitConfig ──────────────────────────────────────────────────────────────

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let state_path = if output.starts_with("/etc") {
        PathBuf::from("/var/lib/dockhost")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".dockhost")
    };

    let config = DaemonConfig {
        state_path,
        ..DaemonConfig::default()
    };
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to adjust the whitelist, then run:");
    println!("  dockhostd run --config {}", output.display());

    Ok(())
}

// ─── Info ────────────────────────────────────────────────────────────────────

async fn fleet_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&config_path)?;
    let state = create_state(config.clone());

    let hosts = state.stores.hosts.read().await.len();
    let apps = state.stores.apps.read().await.list().len();
    let samples = state.stores.samples.read().await.len();
    let chain_ok = state.stores.events.read().await.verify_chain();

    println!("dockhost fleet:");
    println!();
    println!("  State path:  {}", config.state_path.display());
    println!("  Bridge:      {}", config.bridge_addr);
    println!("  Hosts:       {hosts}");
    println!("  Apps:        {apps}");
    println!("  Samples:     {samples}");
    println!(
        "  Audit chain: {}",
        if chain_ok { "intact" } else { "BROKEN" }
    );
    println!();
    println!("  Daemon:      dockhostd v{}", env!("CARGO_PKG_VERSION"));

    Ok(())
}
