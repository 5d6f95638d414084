//! JSON file-backed persistence for dockhost fleet state.
//!
//! [`JsonStore`] keeps one domain of records in memory and snapshots the whole
//! map to `{state_path}/state/{domain}.json` on every write. On top of it sit
//! the typed stores: hosts, apps, file backups, resource samples, profiles.
//!
//! App status changes go through [`AppStore::transition`], a read-modify-write
//! against the persisted record. A transition whose expected status no longer
//! matches fails instead of clobbering a concurrent change.

#![forbid(unsafe_code)]

use chrono::Utc;
use dock_proto::{
    AppRecord, AppStatus, FileBackupRecord, HostRecord, HostStatus, ProfileRecord, ResourceSample,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("status conflict for {id}: expected {expected}, found {actual}")]
    StatusConflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("invariant violation for {id}: {reason}")]
    Invariant { id: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ─── JsonStore ────────────────────────────────────────────────────────────────

/// A JSON snapshot store for one domain of data.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Load the whole domain. Missing or unreadable files start fresh.
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Snapshot the whole domain, creating parent directories as needed.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

// ─── Hosts ────────────────────────────────────────────────────────────────────

pub struct HostStore {
    records: HashMap<String, HostRecord>,
    store: JsonStore,
}

impl HostStore {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "hosts");
        let records = store.load();
        Self { records, store }
    }

    pub fn upsert(&mut self, record: HostRecord) {
        self.records.insert(record.host_id.clone(), record);
        self.snapshot();
    }

    pub fn get(&self, id: &str) -> Option<&HostRecord> {
        self.records.get(id)
    }

    /// Fetch a host scoped to its owner. Elevated callers skip the scope check
    /// by passing `owner_id = None`.
    pub fn get_scoped(&self, id: &str, owner_id: Option<&str>) -> Option<&HostRecord> {
        self.records
            .get(id)
            .filter(|h| owner_id.is_none_or(|uid| h.user_id == uid))
    }

    pub fn list_by_status(&self, status: HostStatus) -> Vec<&HostRecord> {
        self.records.values().filter(|h| h.status == status).collect()
    }

    pub fn set_status(&mut self, id: &str, status: HostStatus) -> StoreResult<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.status = status;
        self.snapshot();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot hosts");
        }
    }
}

// ─── Apps ─────────────────────────────────────────────────────────────────────

pub struct AppStore {
    records: HashMap<String, AppRecord>,
    store: JsonStore,
}

impl AppStore {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "apps");
        let records = store.load();
        Self { records, store }
    }

    pub fn upsert(&mut self, record: AppRecord) {
        self.records.insert(record.app_id.clone(), record);
        self.snapshot();
    }

    pub fn get(&self, id: &str) -> Option<&AppRecord> {
        self.records.get(id)
    }

    pub fn list(&self) -> Vec<&AppRecord> {
        self.records.values().collect()
    }

    /// Apps in any of the given statuses whose last activity is older than
    /// `idle_minutes`.
    pub fn list_idle(&self, statuses: &[AppStatus], idle_minutes: i64) -> Vec<AppRecord> {
        let now = Utc::now();
        self.records
            .values()
            .filter(|a| statuses.contains(&a.status) && a.idle_minutes(now) >= idle_minutes)
            .cloned()
            .collect()
    }

    /// Compare-and-set status transition. Re-reads the record, verifies it is
    /// still in `expected`, applies `apply`, then checks the container/host
    /// pairing rule before persisting.
    pub fn transition<F>(
        &mut self,
        id: &str,
        expected: &[AppStatus],
        apply: F,
    ) -> StoreResult<AppRecord>
    where
        F: FnOnce(&mut AppRecord),
    {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !expected.contains(&record.status) {
            return Err(StoreError::StatusConflict {
                id: id.to_string(),
                expected: expected
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join("|"),
                actual: record.status.to_string(),
            });
        }

        // Apply on a copy so a rejected transition leaves the stored record
        // untouched.
        let mut updated = record.clone();
        apply(&mut updated);

        if !updated.runtime_ids_consistent() {
            return Err(StoreError::Invariant {
                id: id.to_string(),
                reason: format!(
                    "container/server ids inconsistent for status {}",
                    updated.status
                ),
            });
        }

        self.records.insert(id.to_string(), updated.clone());
        self.snapshot();
        Ok(updated)
    }

    pub fn touch_activity(&mut self, id: &str) -> StoreResult<AppRecord> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.last_activity_at = Utc::now();
        let updated = record.clone();
        self.snapshot();
        Ok(updated)
    }

    pub fn remove(&mut self, id: &str) {
        self.records.remove(id);
        self.snapshot();
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot apps");
        }
    }
}

// ─── File backups ─────────────────────────────────────────────────────────────

pub struct BackupStore {
    records: HashMap<String, FileBackupRecord>,
    store: JsonStore,
}

impl BackupStore {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "file_backups");
        let records = store.load();
        Self { records, store }
    }

    /// Upsert keyed on (app_id, file_path): a re-backup of the same file
    /// replaces the previous copy.
    pub fn upsert(&mut self, record: FileBackupRecord) {
        let key = Self::key(&record.app_id, &record.file_path);
        self.records.insert(key, record);
        self.snapshot();
    }

    pub fn upsert_batch(&mut self, records: Vec<FileBackupRecord>) {
        for record in records {
            let key = Self::key(&record.app_id, &record.file_path);
            self.records.insert(key, record);
        }
        self.snapshot();
    }

    pub fn list_for_app(&self, app_id: &str) -> Vec<&FileBackupRecord> {
        self.records
            .values()
            .filter(|r| r.app_id == app_id)
            .collect()
    }

    pub fn remove_for_app(&mut self, app_id: &str) {
        self.records.retain(|_, r| r.app_id != app_id);
        self.snapshot();
    }

    fn key(app_id: &str, file_path: &str) -> String {
        format!("{app_id}:{file_path}")
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot file backups");
        }
    }
}

// ─── Resource samples ─────────────────────────────────────────────────────────

pub struct SampleStore {
    records: HashMap<String, ResourceSample>,
    store: JsonStore,
}

impl SampleStore {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "resource_samples");
        let records = store.load();
        Self { records, store }
    }

    /// Append one sample. Samples are never updated or rewritten.
    pub fn append(&mut self, mut sample: ResourceSample) -> String {
        if sample.sample_id.is_empty() {
            sample.sample_id = Uuid::new_v4().to_string();
        }
        let id = sample.sample_id.clone();
        self.records.insert(id.clone(), sample);
        self.snapshot();
        id
    }

    pub fn list_for_server(&self, server_id: &str) -> Vec<&ResourceSample> {
        let mut samples: Vec<&ResourceSample> = self
            .records
            .values()
            .filter(|s| s.server_id == server_id)
            .collect();
        samples.sort_by_key(|s| s.sampled_at);
        samples
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot resource samples");
        }
    }
}

// ─── Profiles ─────────────────────────────────────────────────────────────────

pub struct ProfileStore {
    records: HashMap<String, ProfileRecord>,
    store: JsonStore,
}

impl ProfileStore {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "profiles");
        let records = store.load();
        Self { records, store }
    }

    pub fn upsert(&mut self, record: ProfileRecord) {
        self.records.insert(record.user_id.clone(), record);
        self.snapshot();
    }

    pub fn get(&self, user_id: &str) -> Option<&ProfileRecord> {
        self.records.get(user_id)
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot profiles");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_proto::UserRole;

    fn ready_app(id: &str) -> AppRecord {
        AppRecord {
            app_id: id.to_string(),
            user_id: "u-1".to_string(),
            name: "demo".to_string(),
            server_id: Some("srv-1".to_string()),
            container_id: Some("c-1".to_string()),
            status: AppStatus::Ready,
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn host(id: &str, user: &str) -> HostRecord {
        HostRecord {
            host_id: id.to_string(),
            user_id: user.to_string(),
            address: "203.0.113.10".to_string(),
            ssh_port: 22,
            ssh_username: "root".to_string(),
            ssh_password: "secret".to_string(),
            status: HostStatus::Ready,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "test");

        let mut data = HashMap::new();
        data.insert("k".to_string(), "v".to_string());
        store.save(&data).expect("save");

        let loaded: HashMap<String, String> = store.load();
        assert_eq!(loaded.get("k").unwrap(), "v");
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        std::fs::write(state_dir.join("bad.json"), "not json").expect("write");

        let store = JsonStore::new(dir.path(), "bad");
        let loaded: HashMap<String, String> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_app_transition_happy_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut apps = AppStore::new(dir.path());
        apps.upsert(ready_app("app-1"));

        let updated = apps
            .transition("app-1", &[AppStatus::Ready], |a| {
                a.status = AppStatus::Suspended;
            })
            .expect("transition");
        assert_eq!(updated.status, AppStatus::Suspended);
        assert_eq!(apps.get("app-1").unwrap().status, AppStatus::Suspended);
    }

    #[test]
    fn test_app_transition_status_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut apps = AppStore::new(dir.path());
        let mut a = ready_app("app-1");
        a.status = AppStatus::Hibernated;
        a.container_id = None;
        a.server_id = None;
        apps.upsert(a);

        let err = apps
            .transition("app-1", &[AppStatus::Ready], |a| {
                a.status = AppStatus::Suspended;
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));
        // Record untouched
        assert_eq!(apps.get("app-1").unwrap().status, AppStatus::Hibernated);
    }

    #[test]
    fn test_app_transition_enforces_runtime_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut apps = AppStore::new(dir.path());
        apps.upsert(ready_app("app-1"));

        // Hibernating without clearing ids must be rejected
        let err = apps
            .transition("app-1", &[AppStatus::Ready], |a| {
                a.status = AppStatus::Hibernated;
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Invariant { .. }));

        // Clearing both ids passes
        apps.transition("app-1", &[AppStatus::Ready], |a| {
            a.status = AppStatus::Hibernated;
            a.container_id = None;
            a.server_id = None;
        })
        .expect("hibernate");
    }

    #[test]
    fn test_app_transition_missing_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut apps = AppStore::new(dir.path());
        let err = apps
            .transition("nope", &[AppStatus::Ready], |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_list_idle_filters_status_and_age() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut apps = AppStore::new(dir.path());

        let mut stale = ready_app("stale");
        stale.last_activity_at = Utc::now() - chrono::Duration::minutes(30);
        apps.upsert(stale);

        let fresh = ready_app("fresh");
        apps.upsert(fresh);

        let mut hibernated = ready_app("hib");
        hibernated.status = AppStatus::Hibernated;
        hibernated.container_id = None;
        hibernated.server_id = None;
        hibernated.last_activity_at = Utc::now() - chrono::Duration::minutes(120);
        apps.upsert(hibernated);

        let idle = apps.list_idle(&[AppStatus::Ready], 20);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].app_id, "stale");
    }

    #[test]
    fn test_backup_upsert_replaces_same_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut backups = BackupStore::new(dir.path());

        let make = |content: &str| FileBackupRecord {
            app_id: "app-1".to_string(),
            user_id: "u-1".to_string(),
            file_path: "src/index.js".to_string(),
            file_content: content.to_string(),
            size_bytes: content.len() as u64,
            backed_up_at: Utc::now(),
        };

        backups.upsert(make("v1"));
        backups.upsert(make("v2"));

        let list = backups.list_for_app("app-1");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].file_content, "v2");
    }

    #[test]
    fn test_sample_store_append_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut samples = SampleStore::new(dir.path());

        for i in 0..3 {
            samples.append(ResourceSample {
                sample_id: String::new(),
                server_id: "srv-1".to_string(),
                user_id: "u-1".to_string(),
                cpu_usage_pct: i as f64,
                memory_used_mib: 512,
                memory_total_mib: 2048,
                disk_usage_pct: 40.0,
                network_rx_bytes: 1000,
                network_tx_bytes: 2000,
                sampled_at: Utc::now(),
            });
        }

        assert_eq!(samples.list_for_server("srv-1").len(), 3);
        assert!(samples.list_for_server("srv-2").is_empty());
    }

    #[test]
    fn test_host_scoped_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut hosts = HostStore::new(dir.path());
        hosts.upsert(host("srv-1", "u-1"));

        assert!(hosts.get_scoped("srv-1", Some("u-1")).is_some());
        assert!(hosts.get_scoped("srv-1", Some("u-2")).is_none());
        // Elevated access skips the owner check
        assert!(hosts.get_scoped("srv-1", None).is_some());
    }

    #[test]
    fn test_store_persistence_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut apps = AppStore::new(dir.path());
            apps.upsert(ready_app("app-1"));
        }
        let apps = AppStore::new(dir.path());
        assert!(apps.get("app-1").is_some());
    }

    #[test]
    fn test_profile_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut profiles = ProfileStore::new(dir.path());
        profiles.upsert(ProfileRecord {
            user_id: "u-1".to_string(),
            role: UserRole::Admin,
        });
        assert!(profiles.get("u-1").unwrap().role.is_elevated());
        assert!(profiles.get("u-2").is_none());
    }
}
