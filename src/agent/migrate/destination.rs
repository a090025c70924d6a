use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    agent::{
        Agent,
        error::{AgentError, AgentResult},
        guest::{GuestGuard, RuntimeState},
        hypervisor::LaunchOptions,
        migrate::{DestPrepareReply, DestPrepareRequest},
        registry::free_port_by_base,
        storage::DiskPrepareContext,
        task::TaskKind,
    },
    constants::{MIGRATE_CERTS_DIR_NAME, MIGRATE_PORT_BASE},
};

impl Agent {
    /// Reserves `id` for an incoming guest. False when the id is already
    /// taken on this host.
    pub async fn can_migrate(&self, id: &str) -> bool {
        match self.registry.create(id).await {
            Ok(_) => true,
            Err(e) => {
                info!(guest_id = id, error = %e, "cannot accept migration");
                false
            }
        }
    }

    /// Destination half of the handshake. Disks are staged one after the
    /// other and the first failure fails the whole request. Memory snapshots
    /// are fetched from the source before anything is launched. A live
    /// migration then starts the guest waiting for the incoming stream.
    pub async fn prepare_migrate_destination(self: &Arc<Self>, req: DestPrepareRequest) -> AgentResult<DestPrepareReply> {
        let id = req.desc.uuid.clone();
        let guest = match self.registry.get_known(&id) {
            Ok(guest) => guest,
            Err(_) => self.registry.create(&id).await?,
        };

        let staging = {
            let mut guard = guest.lock().await;
            Self::check_destination(&guard)?;
            let Some(staging) = guest.begin_staging() else {
                return Err(AgentError::precondition("migration destination already being prepared"));
            };
            guest.prepare_dir().await?;
            guard.save_descriptor(req.desc.clone()).await?;
            staging
        };

        // disks and memory are staged without the guest lock so status and
        // other readers keep answering during long transfers
        let mut desc = req.desc;
        let total = desc.disks.len();
        for (i, disk) in desc.disks.iter_mut().enumerate() {
            let storage_id = req
                .target_storage_ids
                .get(&disk.disk_id)
                .unwrap_or(&disk.storage_id)
                .clone();
            let storage = self
                .storage
                .get(&storage_id)
                .ok_or_else(|| AgentError::Storage(format!("storage {storage_id} not found")))?;
            disk.storage_id = storage_id;
            disk.storage_kind = storage.kind();

            let ctx = DiskPrepareContext {
                guest_id: id.clone(),
                disk: disk.clone(),
                index: i + 1,
                total,
            };
            info!(guest_id = %id, disk_id = %disk.disk_id, index = i + 1, total, "staging disk");
            storage.prepare_migrate_destination(&ctx).await.map_err(|e| {
                AgentError::Storage(format!("disk {} ({}/{total}): {e:#}", disk.disk_id, i + 1))
            })?;
        }

        let mut prepared_memory_snapshots = Vec::with_capacity(req.src_memory_snapshots.len());
        if !req.src_memory_snapshots.is_empty() {
            let uri = req
                .memory_snapshots_uri
                .as_deref()
                .ok_or_else(|| AgentError::precondition("memory snapshots given without source uri"))?;
            for snapshot_id in &req.src_memory_snapshots {
                let url = format!("{}/{id}/{snapshot_id}", uri.trim_end_matches('/'));
                let dest = self.memory_snapshot_path(&id, snapshot_id);
                let size = self
                    .fetcher
                    .fetch(&url, &dest)
                    .await
                    .map_err(|e| AgentError::Internal(e.context(format!("fetch memory snapshot {snapshot_id}"))))?;
                info!(guest_id = %id, %snapshot_id, size, "memory snapshot fetched");
                prepared_memory_snapshots.push(snapshot_id.clone());
            }
        }

        let tls_dir = match &req.migrate_certs {
            Some(certs) => {
                let dir = guest.dir().join(MIGRATE_CERTS_DIR_NAME);
                certs.write(&dir).await?;
                Some(dir)
            }
            None => None,
        };

        let mut guard = guest.lock().await;
        Self::check_destination(&guard)?;
        guard.save_descriptor(desc).await?;
        drop(staging);

        if !req.live_migrate {
            if let Err(e) = self.control_plane.update_migration_progress(&id, 100.0).await {
                warn!(guest_id = %id, error = %e, "failed to report migration progress");
            }
            if guard.runtime() == RuntimeState::Unloaded {
                guard.transition(RuntimeState::Loaded);
            }
            info!(guest_id = %id, "migration destination prepared");
            return Ok(DestPrepareReply {
                prepared_memory_snapshots,
                incoming_port: None,
                task: None,
            });
        }

        let port = free_port_by_base(MIGRATE_PORT_BASE);
        let vnc_port = self.registry.free_vnc_port(&id)?;
        if let Err(e) = guard.update_descriptor(|d| d.vnc_port = Some(vnc_port)).await {
            self.registry.release_vnc_port(&id);
            return Err(e);
        }
        let desc = guard.descriptor()?.clone();
        guard.transition(RuntimeState::Migrating);
        drop(guard);

        let opts = LaunchOptions {
            vnc_port,
            incoming: Some(format!("tcp:0:{port}")),
            tls_dir,
        };
        let task = self.launch(Arc::clone(&guest), desc, opts, TaskKind::PrepareMigrate, RuntimeState::Migrating);
        info!(guest_id = %id, port, "waiting for incoming migration");

        Ok(DestPrepareReply {
            prepared_memory_snapshots,
            incoming_port: Some(port),
            task: Some(task),
        })
    }

    fn check_destination(guard: &GuestGuard<'_>) -> AgentResult<()> {
        if guard.runtime().is_monitored() || guard.runtime() == RuntimeState::Suspended {
            return Err(AgentError::precondition(format!(
                "cannot prepare migration on guest while {:?}",
                guard.runtime()
            )));
        }
        Ok(())
    }
}
