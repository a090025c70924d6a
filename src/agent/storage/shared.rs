use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::info;

use super::{DiskPrepareContext, LocalStorage, Storage, StorageKind};
use crate::agent::guest::descriptor::DiskDesc;

/// Network-mounted storage visible from every host. Disks never move during
/// migration, so destination preparation only checks they are reachable.
pub struct SharedStorage {
    inner: LocalStorage,
    root: PathBuf,
}

impl SharedStorage {
    pub fn new(id: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            inner: LocalStorage::new(id, root.as_ref()),
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Storage for SharedStorage {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Shared
    }

    async fn prepare_migrate_destination(&self, ctx: &DiskPrepareContext) -> Result<()> {
        info!(
            guest_id = %ctx.guest_id,
            disk_id = %ctx.disk.disk_id,
            "checking shared disk {} of {}",
            ctx.index,
            ctx.total
        );
        if !Path::new(&ctx.disk.path).exists() {
            bail!(
                "shared disk {} not visible under {}",
                ctx.disk.path,
                self.root.display()
            );
        }
        Ok(())
    }

    async fn disk_backing_ref(&self, _disk: &DiskDesc) -> Result<Option<String>> {
        Ok(None)
    }

    fn snapshot_overlay_path(&self, disk: &DiskDesc, snapshot_id: &str) -> String {
        self.inner.snapshot_overlay_path(disk, snapshot_id)
    }

    async fn delete_snapshot(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<()> {
        self.inner.delete_snapshot(disk, snapshot_id).await
    }

    async fn convert_snapshot(&self, disk: &DiskDesc, snapshot_id: &str, convert_into: &str) -> Result<()> {
        self.inner.convert_snapshot(disk, snapshot_id, convert_into).await
    }

    async fn clone_disk(&self, disk: &DiskDesc, target_disk_id: &str) -> Result<String> {
        self.inner.clone_disk(disk, target_disk_id).await
    }
}
