//! Persistent store: a write-through key/value tree serialized through
//! the replicated log.
//!
//! Layout (all values are serde_json bytes):
//!
//! ```text
//! /v1/apps/<app_id>/meta
//! /v1/apps/<app_id>/versions/<version_id>
//! /v1/apps/<app_id>/slots/<index>/meta
//! /v1/framework_id
//! ```
//!
//! Every write is proposed as a [`LogEntry`] and acknowledged only after
//! the entry is applied to the local KV; reads are local. The leading
//! `v1` segment versions the layout for forward migration.

mod kv;
mod log;

pub use kv::Kv;
pub use log::{LocalLog, ReplicatedLog};

use std::sync::Arc;

use bosun_id::{AppId, FrameworkId, TaskId, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::state::app::AppRunState;
use crate::state::slot::SlotState;
use crate::state::version::{AppMode, Version};

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Writes are only valid on the leader.
    #[error("not the leader")]
    NotLeader,

    /// A write addressed an entity that does not (or already does) exist.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The replicated log task is gone.
    #[error("replicated log closed")]
    LogClosed,
}

// =============================================================================
// Persisted records
// =============================================================================

/// Persisted app metadata. The proposed version rides in the meta until
/// the rolling update commits it into the version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMeta {
    pub app_id: AppId,
    pub state: AppRunState,
    pub mode: AppMode,
    pub cluster_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub current_version_id: VersionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_version: Option<Version>,
}

/// Persisted slot metadata; one record per `(app, index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotMeta {
    pub app_id: AppId,
    pub index: u32,
    pub state: SlotState,
    pub task_id: TaskId,
    pub version_id: VersionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<bosun_id::AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_host: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_ports: Vec<u16>,
    #[serde(default)]
    pub mark_for_rolling_update: bool,
    #[serde(default)]
    pub mark_for_deletion: bool,
    #[serde(default)]
    pub restarts: u32,
    pub updated: DateTime<Utc>,
}

/// Everything persisted for one app, as loaded on leader takeover.
#[derive(Debug, Clone)]
pub struct StoredApp {
    pub meta: AppMeta,
    pub versions: Vec<Version>,
    pub slots: Vec<SlotMeta>,
}

// =============================================================================
// Log entries
// =============================================================================

/// One totally-ordered write. Entries carry everything needed to apply
/// them, so replaying the log is deterministic and idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogEntry {
    CreateApp { meta: AppMeta, version: Version },
    UpdateApp { meta: AppMeta },
    RemoveApp { app_id: AppId },
    PutVersion { app_id: AppId, version: Version },
    /// Atomically appends the proposed version to the history and clears
    /// it from the meta.
    CommitProposedVersion { app_id: AppId, version: Version },
    PutSlot { slot: SlotMeta },
    RemoveSlot { app_id: AppId, index: u32 },
    PutFrameworkId { id: FrameworkId },
}

// =============================================================================
// Key layout
// =============================================================================

const KEY_FRAMEWORK_ID: &str = "/v1/framework_id";

fn app_prefix(app_id: &AppId) -> String {
    format!("/v1/apps/{app_id}/")
}

fn key_app_meta(app_id: &AppId) -> String {
    format!("/v1/apps/{app_id}/meta")
}

fn key_version(app_id: &AppId, version_id: VersionId) -> String {
    format!("/v1/apps/{app_id}/versions/{version_id}")
}

fn key_slot_meta(app_id: &AppId, index: u32) -> String {
    format!("/v1/apps/{app_id}/slots/{index}/meta")
}

fn slot_prefix(app_id: &AppId, index: u32) -> String {
    format!("/v1/apps/{app_id}/slots/{index}/")
}

// =============================================================================
// Entry application
// =============================================================================

/// Applies one log entry to the local KV. Invoked by the log task, in
/// log order, on every replica.
pub(crate) fn apply_entry(kv: &Kv, entry: &LogEntry) -> Result<(), StoreError> {
    match entry {
        LogEntry::CreateApp { meta, version } => {
            kv.put(&key_app_meta(&meta.app_id), &serde_json::to_vec(meta)?)?;
            kv.put(
                &key_version(&meta.app_id, version.id),
                &serde_json::to_vec(version)?,
            )?;
            Ok(())
        }

        LogEntry::UpdateApp { meta } => {
            let key = key_app_meta(&meta.app_id);
            if !kv.contains(&key)? {
                return Err(StoreError::Conflict(format!(
                    "app {} no longer exists",
                    meta.app_id
                )));
            }
            kv.put(&key, &serde_json::to_vec(meta)?)?;
            Ok(())
        }

        LogEntry::RemoveApp { app_id } => {
            kv.delete_prefix(&app_prefix(app_id))?;
            Ok(())
        }

        LogEntry::PutVersion { app_id, version } => {
            if !kv.contains(&key_app_meta(app_id))? {
                return Err(StoreError::Conflict(format!("app {app_id} no longer exists")));
            }
            kv.put(
                &key_version(app_id, version.id),
                &serde_json::to_vec(version)?,
            )?;
            Ok(())
        }

        LogEntry::CommitProposedVersion { app_id, version } => {
            let key = key_app_meta(app_id);
            let Some(raw) = kv.get(&key)? else {
                return Err(StoreError::Conflict(format!("app {app_id} no longer exists")));
            };
            let mut meta: AppMeta = serde_json::from_slice(&raw)?;
            meta.current_version_id = version.id;
            meta.proposed_version = None;
            meta.updated = Utc::now();
            kv.put(
                &key_version(app_id, version.id),
                &serde_json::to_vec(version)?,
            )?;
            kv.put(&key, &serde_json::to_vec(&meta)?)?;
            Ok(())
        }

        LogEntry::PutSlot { slot } => {
            if !kv.contains(&key_app_meta(&slot.app_id))? {
                return Err(StoreError::Conflict(format!(
                    "app {} no longer exists",
                    slot.app_id
                )));
            }
            kv.put(
                &key_slot_meta(&slot.app_id, slot.index),
                &serde_json::to_vec(slot)?,
            )?;
            Ok(())
        }

        LogEntry::RemoveSlot { app_id, index } => {
            kv.delete_prefix(&slot_prefix(app_id, *index))?;
            Ok(())
        }

        LogEntry::PutFrameworkId { id } => {
            kv.put(KEY_FRAMEWORK_ID, &serde_json::to_vec(id)?)?;
            Ok(())
        }
    }
}

// =============================================================================
// Typed store
// =============================================================================

/// Typed operations over the log-backed KV tree.
pub struct AppStore {
    log: Arc<dyn ReplicatedLog>,
    kv: Arc<Kv>,
}

impl AppStore {
    pub fn new(log: Arc<dyn ReplicatedLog>, kv: Arc<Kv>) -> Self {
        Self { log, kv }
    }

    pub async fn create_app(&self, meta: &AppMeta, version: &Version) -> Result<(), StoreError> {
        if self.kv.contains(&key_app_meta(&meta.app_id))? {
            return Err(StoreError::Conflict(format!(
                "app {} already exists",
                meta.app_id
            )));
        }
        self.log
            .propose(LogEntry::CreateApp {
                meta: meta.clone(),
                version: version.clone(),
            })
            .await
    }

    pub async fn update_app(&self, meta: &AppMeta) -> Result<(), StoreError> {
        self.log
            .propose(LogEntry::UpdateApp { meta: meta.clone() })
            .await
    }

    pub async fn remove_app(&self, app_id: &AppId) -> Result<(), StoreError> {
        self.log
            .propose(LogEntry::RemoveApp {
                app_id: app_id.clone(),
            })
            .await
    }

    pub async fn put_version(&self, app_id: &AppId, version: &Version) -> Result<(), StoreError> {
        self.log
            .propose(LogEntry::PutVersion {
                app_id: app_id.clone(),
                version: version.clone(),
            })
            .await
    }

    pub async fn commit_proposed_version(
        &self,
        app_id: &AppId,
        version: &Version,
    ) -> Result<(), StoreError> {
        self.log
            .propose(LogEntry::CommitProposedVersion {
                app_id: app_id.clone(),
                version: version.clone(),
            })
            .await
    }

    pub async fn put_slot(&self, slot: &SlotMeta) -> Result<(), StoreError> {
        self.log
            .propose(LogEntry::PutSlot { slot: slot.clone() })
            .await
    }

    pub async fn remove_slot(&self, app_id: &AppId, index: u32) -> Result<(), StoreError> {
        self.log
            .propose(LogEntry::RemoveSlot {
                app_id: app_id.clone(),
                index,
            })
            .await
    }

    pub async fn put_framework_id(&self, id: &FrameworkId) -> Result<(), StoreError> {
        self.log
            .propose(LogEntry::PutFrameworkId { id: id.clone() })
            .await
    }

    /// Local read of the persisted framework id.
    pub fn framework_id(&self) -> Result<Option<FrameworkId>, StoreError> {
        match self.kv.get(KEY_FRAMEWORK_ID)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Local read of one app's full persisted form.
    pub fn load_app(&self, app_id: &AppId) -> Result<Option<StoredApp>, StoreError> {
        let entries = self.kv.scan_prefix(&app_prefix(app_id))?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(assemble_app(app_id, &entries)?)
    }

    /// Local read of every persisted app.
    pub fn list_apps(&self) -> Result<Vec<StoredApp>, StoreError> {
        let entries = self.kv.scan_prefix("/v1/apps/")?;

        let mut per_app: Vec<(AppId, Vec<(String, Vec<u8>)>)> = Vec::new();
        for (key, value) in entries {
            let Some(rest) = key.strip_prefix("/v1/apps/") else {
                continue;
            };
            let Some((app_id, _)) = rest.split_once('/') else {
                continue;
            };
            let Ok(app_id) = AppId::parse(app_id) else {
                warn!(key = %key, "Skipping store key with unparsable app id");
                continue;
            };
            if let Some((last, bucket)) = per_app.last_mut() {
                if *last == app_id {
                    bucket.push((key, value));
                    continue;
                }
            }
            per_app.push((app_id, vec![(key, value)]));
        }

        let mut apps = Vec::new();
        for (app_id, entries) in per_app {
            if let Some(app) = assemble_app(&app_id, &entries)? {
                apps.push(app);
            }
        }
        Ok(apps)
    }
}

fn assemble_app(
    app_id: &AppId,
    entries: &[(String, Vec<u8>)],
) -> Result<Option<StoredApp>, StoreError> {
    let prefix = app_prefix(app_id);
    let mut meta: Option<AppMeta> = None;
    let mut versions: Vec<Version> = Vec::new();
    let mut slots: Vec<SlotMeta> = Vec::new();

    for (key, value) in entries {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        if rest == "meta" {
            meta = Some(serde_json::from_slice(value)?);
        } else if rest.starts_with("versions/") {
            versions.push(serde_json::from_slice(value)?);
        } else if rest.starts_with("slots/") && rest.ends_with("/meta") {
            slots.push(serde_json::from_slice(value)?);
        }
    }

    let Some(meta) = meta else {
        warn!(app_id = %app_id, "Skipping app subtree without meta record");
        return Ok(None);
    };
    slots.sort_by_key(|s| s.index);
    versions.sort_by_key(|v| v.id);
    Ok(Some(StoredApp {
        meta,
        versions,
        slots,
    }))
}
