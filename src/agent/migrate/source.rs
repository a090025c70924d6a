use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde_json::json;
use tracing::{info, warn};

use crate::{
    agent::{
        Agent,
        block::begin_all,
        error::{AgentError, AgentResult},
        guest::{BlockJobKind, RuntimeState},
        hypervisor::{MirrorSync, MonitorCommand},
        migrate::{
            LiveMigrateRequest, MigrateCerts, SourcePrepareReply, SourcePrepareRequest, wait_for_migration,
            wait_for_mirrors,
        },
        storage::StorageKind,
        task::{TaskHandle, TaskKind, TaskOutcome},
    },
    constants::MIGRATE_CERTS_DIR_NAME,
};

impl Agent {
    /// Source half of the handshake: says how each disk can be staged on the
    /// destination and, for a secured live migration, issues the TLS
    /// material both sides use.
    pub async fn prepare_migrate_source(&self, id: &str, req: SourcePrepareRequest) -> AgentResult<SourcePrepareReply> {
        let guest = self.guest(id)?;
        let desc = guest.lock().await.descriptor()?.clone();

        let mut disks_back = BTreeMap::new();
        for disk in &desc.disks {
            let storage = self
                .storage
                .for_disk(disk)
                .map_err(|e| AgentError::Storage(e.to_string()))?;
            if let Some(backing) = storage.disk_backing_ref(disk).await? {
                disks_back.insert(disk.disk_id.clone(), backing);
            }
        }

        let migrate_certs = if req.live_migrate && req.use_tls {
            let certs = MigrateCerts::generate()?;
            certs.write(&guest.dir().join(MIGRATE_CERTS_DIR_NAME)).await?;
            Some(certs)
        } else {
            None
        };

        info!(guest_id = id, disks = disks_back.len(), tls = migrate_certs.is_some(), "migration source prepared");
        Ok(SourcePrepareReply {
            disks_back,
            migrate_certs,
        })
    }

    /// Moves a running guest to another host. Local disks are mirrored first
    /// when a mirror target is given; then memory is transferred and the
    /// source process quits. On failure the guest keeps running here.
    pub async fn live_migrate(self: &Arc<Self>, id: &str, req: LiveMigrateRequest) -> AgentResult<TaskHandle> {
        let (guest, monitor) = self.running(id).await?;

        let tls_dir = if req.use_tls {
            let dir = guest.dir().join(MIGRATE_CERTS_DIR_NAME);
            if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                return Err(AgentError::precondition("migration certificates missing"));
            }
            Some(dir.to_string_lossy().into_owned())
        } else {
            None
        };

        let (mem_mb, mirrored) = {
            let mut guard = guest.lock().await;
            let desc = guard.descriptor()?;
            let mem_mb = desc.mem_mb;
            let mirrored: Vec<(String, String)> = if req.mirror_target.is_some() {
                desc.disks
                    .iter()
                    .filter(|d| d.storage_kind == StorageKind::Local)
                    .map(|d| (d.disk_id.clone(), d.drive_name()))
                    .collect()
            } else {
                Vec::new()
            };
            begin_all(guard.state_mut(), &mirrored, BlockJobKind::Mirror)?;
            guard.transition(RuntimeState::Migrating);
            (mem_mb, mirrored)
        };

        let settings = &self.config.migration;
        let timeout = Duration::from_secs(mem_mb / settings.expected_rate_mb.max(1)).max(settings.min_timeout);
        let (poll, precopy_timeout) = (settings.precopy_poll, settings.precopy_timeout);
        let drives: Vec<String> = mirrored.iter().map(|(_, drive)| drive.clone()).collect();
        let disk_ids: Vec<String> = mirrored.into_iter().map(|(disk_id, _)| disk_id).collect();
        let control_plane = self.control_plane.clone();

        let work = {
            let id = id.to_string();
            let monitor = monitor.clone();
            let drives = drives.clone();
            async move {
                if let Some(target) = &req.mirror_target {
                    for drive in &drives {
                        monitor
                            .execute(MonitorCommand::DriveMirror {
                                drive: drive.clone(),
                                target: format!("{target}:exportname={drive}"),
                                sync: MirrorSync::Full,
                            })
                            .await?;
                    }
                    wait_for_mirrors(&monitor, &drives, poll, precopy_timeout).await?;
                }

                let uri = format!("tcp:{}:{}", req.dest_host, req.dest_port);
                monitor
                    .execute(MonitorCommand::Migrate {
                        uri: uri.clone(),
                        tls_dir,
                    })
                    .await?;

                wait_for_migration(&monitor, poll, timeout, |progress| {
                    let control_plane = control_plane.clone();
                    let id = id.clone();
                    async move {
                        if let Err(e) = control_plane.update_migration_progress(&id, progress).await {
                            warn!(guest_id = %id, error = %e, "failed to report migration progress");
                        }
                    }
                })
                .await?;

                if let Err(e) = control_plane.update_migration_progress(&id, 100.0).await {
                    warn!(guest_id = %id, error = %e, "failed to report migration progress");
                }
                if let Err(e) = monitor.execute(MonitorCommand::Quit).await {
                    warn!(guest_id = %id, error = %e, "source quit after migration failed");
                }
                anyhow::Ok(json!({ "uri": uri }))
            }
        };

        let registry = self.registry.clone();
        Ok(self.tasks.spawn(TaskKind::Migrate, id, work, move |outcome: TaskOutcome| async move {
            if outcome.is_success() {
                let mut guard = guest.lock().await;
                guard.state_mut().block_jobs.clear();
                guard.transition(RuntimeState::Stopped);
                registry.release_vnc_port(guest.id());
                return;
            }

            if let Err(e) = monitor.execute(MonitorCommand::MigrateCancel).await {
                warn!(guest_id = %guest.id(), error = %e, "migrate cancel failed");
            }
            for drive in drives {
                if let Err(e) = monitor.execute(MonitorCommand::BlockJobCancel { drive }).await {
                    warn!(guest_id = %guest.id(), error = %e, "mirror cancel failed");
                }
            }

            let mut guard = guest.lock().await;
            for disk_id in &disk_ids {
                guard.state_mut().end_block_job(disk_id);
            }
            guard.transition(RuntimeState::Running);
        }))
    }
}
