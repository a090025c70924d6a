use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::agent::{
    Agent,
    error::{AgentError, AgentResult},
    guest::{
        BlockJobKind, BlockJobRecord, Guest, GuestState,
        descriptor::{DiskDesc, GuestDescriptor},
    },
    hypervisor::{MirrorSync, MonitorCommand, MonitorHandle},
    lifecycle::STATUS_STOPPED,
    storage::Storage,
    task::{TaskHandle, TaskKind, TaskOutcome},
};

#[derive(Debug)]
pub enum SnapshotDeletion {
    /// A leaf snapshot was removed synchronously.
    Deleted,
    /// The snapshot is folded into its dependent first; done when the task is.
    Converting(TaskHandle),
}

fn find_disk<'a>(state: &'a GuestState, disk_id: &str) -> AgentResult<&'a DiskDesc> {
    state
        .descriptor()?
        .disk(disk_id)
        .ok_or_else(|| AgentError::precondition(format!("disk {disk_id} not found")))
}

impl Agent {
    fn storage_for(&self, disk: &DiskDesc) -> AgentResult<Arc<dyn Storage>> {
        self.storage
            .for_disk(disk)
            .map_err(|e| AgentError::Storage(e.to_string()))
    }

    /// Takes an external snapshot of a running guest's disk. The new overlay
    /// becomes the disk's active layer and the old image its backing file.
    pub async fn create_snapshot(
        self: &Arc<Self>,
        id: &str,
        disk_id: &str,
        snapshot_id: &str,
    ) -> AgentResult<TaskHandle> {
        let (guest, monitor) = self.running(id).await?;
        let (drive, overlay) = {
            let mut guard = guest.lock().await;
            let disk = find_disk(&guard, disk_id)?.clone();
            let storage = self.storage_for(&disk)?;
            guard.state_mut().begin_block_job(
                BlockJobRecord::new(disk_id, BlockJobKind::SnapshotCreate).with_snapshot(snapshot_id),
            )?;
            (disk.drive_name(), storage.snapshot_overlay_path(&disk, snapshot_id))
        };

        let disk_id = disk_id.to_string();
        let work = {
            let guest = guest.clone();
            let disk_id = disk_id.clone();
            let snapshot_id = snapshot_id.to_string();
            async move {
                monitor
                    .execute(MonitorCommand::SnapshotBlkdev {
                        drive,
                        overlay: overlay.clone(),
                    })
                    .await?;

                let mut guard = guest.lock().await;
                guard
                    .update_descriptor(|d| {
                        if let Some(disk) = d.disk_mut(&disk_id) {
                            disk.backing_file = Some(std::mem::replace(&mut disk.path, overlay.clone()));
                        }
                    })
                    .await?;
                anyhow::Ok(json!({ "snapshot_id": snapshot_id, "path": overlay }))
            }
        };

        Ok(self.tasks.spawn(TaskKind::SnapshotCreate, id, work, move |_| async move {
            guest.lock().await.state_mut().end_block_job(&disk_id);
        }))
    }

    /// Removes a disk snapshot. A snapshot other layers still depend on has
    /// to be folded into `convert_into` first, which runs as a task.
    pub async fn delete_snapshot(
        self: &Arc<Self>,
        id: &str,
        disk_id: &str,
        snapshot_id: &str,
        convert_into: Option<String>,
    ) -> AgentResult<SnapshotDeletion> {
        let guest = self.guest(id)?;
        let mut guard = guest.lock().await;
        let disk = find_disk(&guard, disk_id)?.clone();
        let storage = self.storage_for(&disk)?;

        let Some(convert_into) = convert_into else {
            if let Some(active) = guard.block_jobs.get(disk_id) {
                return Err(AgentError::precondition(format!(
                    "disk {disk_id} has an active {:?} job",
                    active.kind
                )));
            }
            drop(guard);
            storage
                .delete_snapshot(&disk, snapshot_id)
                .await
                .map_err(|e| AgentError::Storage(format!("{e:#}")))?;
            info!(guest_id = id, %disk_id, %snapshot_id, "snapshot deleted");
            return Ok(SnapshotDeletion::Deleted);
        };

        guard.state_mut().begin_block_job(
            BlockJobRecord::new(disk_id, BlockJobKind::SnapshotConvert)
                .with_snapshot(snapshot_id)
                .with_convert_into(Some(convert_into.clone())),
        )?;
        drop(guard);

        let work = {
            let snapshot_id = snapshot_id.to_string();
            async move {
                storage
                    .convert_snapshot(&disk, &snapshot_id, &convert_into)
                    .await?;
                anyhow::Ok(json!({ "snapshot_id": snapshot_id, "convert_into": convert_into }))
            }
        };

        let disk_id = disk_id.to_string();
        let task = self.tasks.spawn(TaskKind::SnapshotDelete, id, work, move |_| async move {
            guest.lock().await.state_mut().end_block_job(&disk_id);
        });
        Ok(SnapshotDeletion::Converting(task))
    }

    /// Starts mirroring the guest's disks to an NBD export at `target_uri`.
    /// With a descriptor only the disks it lists are mirrored. The task ends
    /// once every mirror is running; the jobs themselves finish or get
    /// cancelled later.
    pub async fn drive_mirror(
        self: &Arc<Self>,
        id: &str,
        target_uri: &str,
        only: Option<&GuestDescriptor>,
        sync: MirrorSync,
    ) -> AgentResult<TaskHandle> {
        let (guest, monitor) = self.running(id).await?;
        let disks: Vec<(String, String)> = {
            let mut guard = guest.lock().await;
            let disks: Vec<(String, String)> = guard
                .descriptor()?
                .disks
                .iter()
                .filter(|d| only.is_none_or(|o| o.disk(&d.disk_id).is_some()))
                .map(|d| (d.disk_id.clone(), d.drive_name()))
                .collect();
            if disks.is_empty() {
                return Err(AgentError::precondition("no disk to mirror"));
            }
            begin_all(guard.state_mut(), &disks, BlockJobKind::Mirror)?;
            disks
        };

        let disk_ids: Vec<String> = disks.iter().map(|(d, _)| d.clone()).collect();
        let target_uri = target_uri.to_string();
        let work = async move {
            let mut drives = Vec::with_capacity(disks.len());
            for (_, drive) in disks {
                monitor
                    .execute(MonitorCommand::DriveMirror {
                        target: format!("{target_uri}:exportname={drive}"),
                        drive: drive.clone(),
                        sync,
                    })
                    .await?;
                drives.push(drive);
            }
            anyhow::Ok(json!({ "drives": drives }))
        };

        Ok(self.tasks.spawn(TaskKind::DriveMirror, id, work, move |outcome: TaskOutcome| async move {
            if !outcome.is_success() {
                end_all(&guest, &disk_ids).await;
            }
        }))
    }

    /// Cancels every block job the hypervisor reports for the guest. On a
    /// stopped guest there is nothing to cancel and no call is made. A paused
    /// guest has no control channel of its own, so a short-lived one is
    /// opened for the cancels. Job records are dropped only once every
    /// cancel went through.
    pub async fn cancel_block_jobs(self: &Arc<Self>, id: &str) -> AgentResult<Option<TaskHandle>> {
        let guest = self.guest(id)?;
        if self.status(id).await == STATUS_STOPPED {
            return Ok(None);
        }

        let monitor = guest.lock().await.monitor();
        let (monitor, transient) = match monitor {
            Some(monitor) => (monitor, false),
            None => (MonitorHandle::new(id, self.hypervisor.clone()), true),
        };

        let work = {
            let guest = guest.clone();
            let id = id.to_string();
            async move {
                let cancelled = cancel_reported_jobs(&monitor, &id).await;
                if transient {
                    monitor.disconnect().await;
                }
                let cancelled = cancelled?;
                guest.lock().await.state_mut().block_jobs.clear();
                anyhow::Ok(json!({ "cancelled": cancelled }))
            }
        };

        Ok(Some(self.tasks.spawn(TaskKind::BlockJobCancel, id, work, |_| async {})))
    }
}

async fn cancel_reported_jobs(monitor: &MonitorHandle, guest_id: &str) -> anyhow::Result<usize> {
    let jobs = monitor.block_jobs().await?;
    for job in &jobs {
        if let Err(e) = monitor
            .execute(MonitorCommand::BlockJobCancel {
                drive: job.device.clone(),
            })
            .await
        {
            warn!(guest_id, device = %job.device, error = %e, "block job cancel failed");
            return Err(e.into());
        }
    }
    Ok(jobs.len())
}

/// Registers one job per disk, all or nothing.
pub(crate) fn begin_all(state: &mut GuestState, disks: &[(String, String)], kind: BlockJobKind) -> AgentResult<()> {
    for (i, (disk_id, _)) in disks.iter().enumerate() {
        if let Err(e) = state.begin_block_job(BlockJobRecord::new(disk_id, kind)) {
            for (begun, _) in &disks[..i] {
                state.end_block_job(begun);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Ends the job records of `disk_ids`, used when the jobs are abandoned.
pub(crate) async fn end_all(guest: &Guest, disk_ids: &[String]) {
    let mut guard = guest.lock().await;
    for disk_id in disk_ids {
        guard.state_mut().end_block_job(disk_id);
    }
}
