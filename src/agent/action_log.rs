use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    agent::control_plane::ControlPlane,
    machinery::store::{Key, PartialKey, Store},
};

const COLLECTION: &str = "actions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Important,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: String,
    pub obj_id: String,
    pub obj_type: String,
    pub action: String,
    pub success: bool,
    #[serde(default)]
    pub notes: String,
    pub start_time: DateTime<Utc>,
    pub ops_time: DateTime<Utc>,
    pub severity: Severity,
}

impl ActionLogEntry {
    pub fn guest(
        guest_id: impl Into<String>,
        action: impl Into<String>,
        success: bool,
        notes: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            obj_id: guest_id.into(),
            obj_type: "server".to_string(),
            action: action.into(),
            success,
            notes: notes.into(),
            start_time,
            ops_time: Utc::now(),
            severity: if success {
                Severity::Info
            } else {
                Severity::Important
            },
        }
    }

    fn key(&self) -> Key<ActionLogEntry> {
        // zero padded so the key order is chronological
        Key::new(
            COLLECTION,
            format!(
                "{}/{:020}-{}",
                self.obj_id,
                self.ops_time.timestamp_millis(),
                self.id
            ),
        )
    }
}

/// Local journal of completed operations, mirrored to the control plane when
/// it is reachable.
pub struct ActionLog {
    store: Arc<Store>,
    control_plane: Arc<dyn ControlPlane>,
}

impl ActionLog {
    pub fn new(store: Arc<Store>, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            store,
            control_plane,
        }
    }

    pub async fn record(&self, entry: ActionLogEntry) {
        debug!(guest_id = %entry.obj_id, action = %entry.action, success = entry.success, "action");

        if let Err(e) = self.store.put(&entry.key(), &entry) {
            warn!(guest_id = %entry.obj_id, error = %e, "failed to journal action");
        }

        if let Err(e) = self.control_plane.record_action(&entry).await {
            warn!(guest_id = %entry.obj_id, error = %e, "failed to forward action");
        }
    }

    /// Most recent entries for a guest, newest first.
    pub fn recent(&self, guest_id: &str, limit: usize) -> Result<Vec<ActionLogEntry>> {
        self.store.list_last(
            &PartialKey::<ActionLogEntry>::prefixed(COLLECTION, format!("{guest_id}/")),
            limit,
        )
    }

    pub fn purge(&self, guest_id: &str) -> Result<usize> {
        self.store
            .delete_prefix(&PartialKey::<ActionLogEntry>::prefixed(
                COLLECTION,
                format!("{guest_id}/"),
            ))
    }
}
