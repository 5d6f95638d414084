//! Immutable append-only event log with SHA-256 chain hashing.
//!
//! Every security decision and lifecycle transition is logged here before (or
//! as) it happens: blocked commands, bypassed validation, suspensions,
//! hibernations, recoveries. Records are chained — tampering with any record
//! breaks the chain.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use dock_persist::JsonStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CommandExecuted,
    CommandBlocked,
    CommandSecurityBypassed,
    AppSuspended,
    AppHibernated,
    AppRestored,
    AppWoken,
    AppRecoveryStarted,
    AppRecoverySucceeded,
    AppRecoveryFailed,
    StatsCollected,
    SessionOpened,
    SessionClosed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            serde_json::to_value(self)
                .unwrap_or_default()
                .as_str()
                .unwrap_or("unknown")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub user_id: String,
    pub server_id: Option<String>,
    pub app_id: Option<String>,
    pub description: String,
    /// The command that triggered the event, where one exists.
    pub command: Option<String>,
    /// SHA-256 hex of previous record (empty string for first record).
    pub previous_hash: String,
    /// SHA-256 hex of this record's canonical JSON.
    pub record_hash: String,
}

// ─── EventLog ─────────────────────────────────────────────────────────────────

pub struct EventLog {
    records: HashMap<String, EventRecord>,
    store: JsonStore,
    last_hash: String,
}

impl EventLog {
    /// Create or load the event log from disk.
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "event_log");
        let records: HashMap<String, EventRecord> = store.load();

        // Continue the chain from the newest record
        let last_hash = records
            .values()
            .max_by_key(|r| r.timestamp)
            .map(|r| r.record_hash.clone())
            .unwrap_or_default();

        info!(record_count = records.len(), "event log initialized");
        Self {
            records,
            store,
            last_hash,
        }
    }

    /// Append a new event. Returns the record hash.
    ///
    /// Call this BEFORE executing any destructive remote action.
    pub fn append(
        &mut self,
        event_type: EventType,
        user_id: &str,
        server_id: Option<&str>,
        app_id: Option<&str>,
        description: &str,
        command: Option<&str>,
    ) -> String {
        let record_id = Uuid::new_v4();
        let timestamp = Utc::now();

        // Canonical JSON for hashing (record_hash excluded)
        let canonical = serde_json::json!({
            "record_id": record_id,
            "timestamp": timestamp,
            "event_type": event_type,
            "user_id": user_id,
            "server_id": server_id,
            "app_id": app_id,
            "description": description,
            "command": command,
            "previous_hash": self.last_hash,
        });

        let record_hash = sha256_hex(&canonical.to_string());

        let record = EventRecord {
            record_id,
            timestamp,
            event_type,
            user_id: user_id.to_string(),
            server_id: server_id.map(|s| s.to_string()),
            app_id: app_id.map(|s| s.to_string()),
            description: description.to_string(),
            command: command.map(|s| s.to_string()),
            previous_hash: self.last_hash.clone(),
            record_hash: record_hash.clone(),
        };

        info!(
            record_id = %record_id,
            event = %event_type,
            user = %user_id,
            "event appended"
        );

        self.last_hash = record_hash.clone();
        self.records.insert(record_id.to_string(), record);
        self.snapshot();

        record_hash
    }

    /// Query events with filters, newest first.
    pub fn query(
        &self,
        user_id: Option<&str>,
        app_id: Option<&str>,
        event_type: Option<EventType>,
        limit: usize,
    ) -> Vec<&EventRecord> {
        let mut results: Vec<&EventRecord> = self
            .records
            .values()
            .filter(|r| {
                if user_id.is_some_and(|uid| r.user_id != uid) {
                    return false;
                }
                if app_id.is_some_and(|aid| r.app_id.as_deref() != Some(aid)) {
                    return false;
                }
                if event_type.is_some_and(|et| r.event_type != et) {
                    return false;
                }
                true
            })
            .collect();

        results.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
        results.truncate(limit);
        results
    }

    /// Verify the integrity of the chain.
    pub fn verify_chain(&self) -> bool {
        let mut sorted: Vec<&EventRecord> = self.records.values().collect();
        sorted.sort_by_key(|r| r.timestamp);

        let mut prev_hash = String::new();
        for record in sorted {
            if record.previous_hash != prev_hash {
                warn!(
                    record_id = %record.record_id,
                    expected = %prev_hash,
                    got = %record.previous_hash,
                    "chain integrity violation"
                );
                return false;
            }
            prev_hash = record.record_hash.clone();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot event log");
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
