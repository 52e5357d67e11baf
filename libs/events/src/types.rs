//! Domain event definitions.

use bosun_id::{AppId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AppCreated,
    AppUpdated,
    AppDeleted,
    SlotRunning,
    SlotKilled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::AppCreated => "app.created",
            EventKind::AppUpdated => "app.updated",
            EventKind::AppDeleted => "app.deleted",
            EventKind::SlotRunning => "slot.running",
            EventKind::SlotKilled => "slot.killed",
        };
        write!(f, "{s}")
    }
}

/// Where a running slot can be reached.
///
/// Carried on `slot.running` so the DNS and proxy subscribers can publish
/// records without a store round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEndpoint {
    /// Agent hostname the task landed on.
    pub host: String,

    /// Static IP for fixed-mode apps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Host ports mapped for the task (replicates mode).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
}

/// One domain event as published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub app_id: AppId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_index: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub occurred_at: DateTime<Utc>,

    /// Event-specific payload; `slot.running` carries a [`SlotEndpoint`].
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DomainEvent {
    fn new(kind: EventKind, app_id: AppId) -> Self {
        Self {
            kind,
            app_id,
            slot_index: None,
            task_id: None,
            occurred_at: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn app_created(app_id: AppId) -> Self {
        Self::new(EventKind::AppCreated, app_id)
    }

    pub fn app_updated(app_id: AppId) -> Self {
        Self::new(EventKind::AppUpdated, app_id)
    }

    pub fn app_deleted(app_id: AppId) -> Self {
        Self::new(EventKind::AppDeleted, app_id)
    }

    pub fn slot_running(app_id: AppId, index: u32, task_id: TaskId, endpoint: SlotEndpoint) -> Self {
        let mut event = Self::new(EventKind::SlotRunning, app_id);
        event.slot_index = Some(index);
        event.task_id = Some(task_id);
        event.payload = serde_json::to_value(endpoint).unwrap_or(serde_json::Value::Null);
        event
    }

    pub fn slot_killed(app_id: AppId, index: u32, task_id: TaskId) -> Self {
        let mut event = Self::new(EventKind::SlotKilled, app_id);
        event.slot_index = Some(index);
        event.task_id = Some(task_id);
        event
    }

    /// Decodes the `slot.running` endpoint payload, if present.
    pub fn endpoint(&self) -> Option<SlotEndpoint> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}
