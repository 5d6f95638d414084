//! dockhostd — dockhost daemon
//!
//! Supervises per-user sandboxed app containers on remote SSH hosts: scripted
//! command execution behind a safety validator, a WebSocket terminal bridge,
//! and periodic lifecycle sweeps (stats, suspension, hibernation).

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod exec;

use std::sync::Arc;
use std::time::Duration;

use dock_bridge::{BridgeContext, SessionRegistry};
use dock_guard::Whitelist;
use dock_lifecycle::{LifecycleStores, LifecycleThresholds};
use dock_persist::ProfileStore;
use tokio::sync::RwLock;

pub use config::DaemonConfig;

// ─── Shared state ─────────────────────────────────────────────────────────────

/// Shared state — passed by reference into command handlers and the bridge.
#[derive(Clone)]
pub struct SharedState {
    pub config: DaemonConfig,
    pub whitelist: Whitelist,
    pub stores: LifecycleStores,
    pub profiles: Arc<RwLock<ProfileStore>>,
}

impl SharedState {
    pub fn new(config: DaemonConfig) -> Self {
        let whitelist = Whitelist::new(config.whitelist.iter().map(String::as_str));
        let stores = LifecycleStores::new(&config.state_path);
        let profiles = Arc::new(RwLock::new(ProfileStore::new(&config.state_path)));

        Self {
            config,
            whitelist,
            stores,
            profiles,
        }
    }

    pub fn thresholds(&self) -> LifecycleThresholds {
        LifecycleThresholds {
            suspend_after_mins: self.config.suspend_after_mins,
            hibernate_after_mins: self.config.hibernate_after_mins,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }

    pub fn bridge_context(&self) -> BridgeContext {
        BridgeContext {
            hosts: self.stores.hosts.clone(),
            profiles: self.profiles.clone(),
            events: self.stores.events.clone(),
            registry: SessionRegistry::new(),
            connect_timeout: self.connect_timeout(),
        }
    }
}

/// Create shared state from config.
pub fn create_state(config: DaemonConfig) -> SharedState {
    SharedState::new(config)
}
