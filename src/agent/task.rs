use std::{fmt, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    agent::{
        action_log::{ActionLog, ActionLogEntry},
        control_plane::{ControlPlane, TaskReport},
    },
    utils::id::task_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Start,
    Stop,
    Suspend,
    Resume,
    Hotplug,
    Migrate,
    PrepareMigrate,
    SnapshotCreate,
    SnapshotDelete,
    DriveMirror,
    BlockJobCancel,
    CloneDisk,
    MemorySnapshot,
    MemorySnapshotReset,
    Sync,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
            TaskKind::Suspend => "suspend",
            TaskKind::Resume => "resume",
            TaskKind::Hotplug => "hotplug",
            TaskKind::Migrate => "migrate",
            TaskKind::PrepareMigrate => "prepare_migrate",
            TaskKind::SnapshotCreate => "snapshot_create",
            TaskKind::SnapshotDelete => "snapshot_delete",
            TaskKind::DriveMirror => "drive_mirror",
            TaskKind::BlockJobCancel => "block_job_cancel",
            TaskKind::CloneDisk => "clone_disk",
            TaskKind::MemorySnapshot => "memory_snapshot",
            TaskKind::MemorySnapshotReset => "memory_snapshot_reset",
            TaskKind::Sync => "sync",
        }
    }

    /// Status string reported upstream when a task of this kind fails.
    pub fn failure_status(&self) -> String {
        format!("{}_fail", self.as_str())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Value),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }
}

#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub kind: TaskKind,
    pub guest_id: String,
    pub started: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: String,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub async fn wait(self) -> TaskOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| TaskOutcome::Failed("task dropped".to_string()))
    }
}

/// Runs long operations off the request path. Each unit of work runs in its
/// own tokio task so a panic stays inside it; the completion hook then fires
/// exactly once with the outcome, after which the result is reported
/// upstream and journaled.
pub struct TaskEngine {
    active: papaya::HashMap<String, ActiveTask>,
    control_plane: Arc<dyn ControlPlane>,
    action_log: Arc<ActionLog>,
}

impl TaskEngine {
    pub fn new(control_plane: Arc<dyn ControlPlane>, action_log: Arc<ActionLog>) -> Arc<Self> {
        Arc::new(Self {
            active: papaya::HashMap::new(),
            control_plane,
            action_log,
        })
    }

    pub fn spawn<W, C, CF>(
        self: &Arc<Self>,
        kind: TaskKind,
        guest_id: impl Into<String>,
        work: W,
        on_complete: C,
    ) -> TaskHandle
    where
        W: Future<Output = anyhow::Result<Value>> + Send + 'static,
        C: FnOnce(TaskOutcome) -> CF + Send + 'static,
        CF: Future<Output = ()> + Send + 'static,
    {
        let guest_id = guest_id.into();
        let task_id = task_id(kind.as_str());
        let started = Utc::now();

        self.active.pin().insert(
            task_id.clone(),
            ActiveTask {
                kind,
                guest_id: guest_id.clone(),
                started,
            },
        );
        info!(%task_id, %guest_id, %kind, "task started");

        let (tx, rx) = oneshot::channel();
        let engine = self.clone();
        let id = task_id.clone();

        tokio::spawn(async move {
            let outcome = match tokio::spawn(work).await {
                Ok(Ok(body)) => TaskOutcome::Succeeded(body),
                Ok(Err(e)) => TaskOutcome::Failed(format!("{e:#}")),
                Err(e) if e.is_panic() => TaskOutcome::Failed("task panicked".to_string()),
                Err(e) => TaskOutcome::Failed(e.to_string()),
            };

            match &outcome {
                TaskOutcome::Succeeded(_) => info!(task_id = %id, %guest_id, %kind, "task succeeded"),
                TaskOutcome::Failed(reason) => {
                    warn!(task_id = %id, %guest_id, %kind, %reason, "task failed")
                }
            }

            let hook = on_complete(outcome.clone());
            if let Err(e) = tokio::spawn(hook).await {
                error!(task_id = %id, %guest_id, error = %e, "completion hook panicked");
            }

            engine.finish(&id, &guest_id, kind, started, &outcome).await;
            let _ = tx.send(outcome);
        });

        TaskHandle {
            task_id,
            outcome: rx,
        }
    }

    async fn finish(
        &self,
        task_id: &str,
        guest_id: &str,
        kind: TaskKind,
        started: DateTime<Utc>,
        outcome: &TaskOutcome,
    ) {
        self.active.pin().remove(task_id);

        let (success, body, notes) = match outcome {
            TaskOutcome::Succeeded(body) => (true, body.clone(), String::new()),
            TaskOutcome::Failed(reason) => {
                (false, serde_json::json!({ "reason": reason }), reason.clone())
            }
        };

        let report = TaskReport {
            task_id: task_id.to_string(),
            guest_id: guest_id.to_string(),
            kind: kind.as_str().to_string(),
            success,
            body,
        };
        if let Err(e) = self.control_plane.report_task(&report).await {
            warn!(task_id, guest_id, error = %e, "failed to report task");
        }

        if !success {
            if let Err(e) = self
                .control_plane
                .update_status(guest_id, &kind.failure_status())
                .await
            {
                warn!(task_id, guest_id, error = %e, "failed to report failure status");
            }
        }

        self.action_log
            .record(ActionLogEntry::guest(guest_id, kind.as_str(), success, notes, started))
            .await;
    }

    pub fn active(&self) -> Vec<(String, ActiveTask)> {
        self.active
            .pin()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn active_for(&self, guest_id: &str) -> Vec<ActiveTask> {
        self.active
            .pin()
            .values()
            .filter(|t| t.guest_id == guest_id)
            .cloned()
            .collect()
    }
}
