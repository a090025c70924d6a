use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{DiskPrepareContext, Storage, StorageKind, qemu_img};
use crate::agent::guest::descriptor::DiskDesc;

/// qcow2 files on a host-local directory. Snapshots sit next to the disk
/// under `snapshots/{disk_id}/`.
pub struct LocalStorage {
    id: String,
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(id: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            root: root.as_ref().to_path_buf(),
        }
    }

    fn snapshot_path(&self, disk: &DiskDesc, snapshot_id: &str) -> PathBuf {
        self.root
            .join("snapshots")
            .join(&disk.disk_id)
            .join(format!("{snapshot_id}.qcow2"))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn prepare_migrate_destination(&self, ctx: &DiskPrepareContext) -> Result<()> {
        let disk = &ctx.disk;
        info!(
            guest_id = %ctx.guest_id,
            disk_id = %disk.disk_id,
            "preparing disk {} of {}",
            ctx.index,
            ctx.total
        );

        let path = Path::new(&disk.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        // an empty target of the same size; the mirror fills it in
        let size = format!("{}M", disk.size_mb);
        match &disk.backing_file {
            Some(backing) => {
                if !Path::new(backing).exists() {
                    anyhow::bail!("backing file {backing} missing for disk {}", disk.disk_id);
                }
                qemu_img(&["create", "-f", "qcow2", "-b", backing, "-F", "qcow2", &disk.path, &size]).await
            }
            None => qemu_img(&["create", "-f", "qcow2", &disk.path, &size]).await,
        }
    }

    async fn disk_backing_ref(&self, disk: &DiskDesc) -> Result<Option<String>> {
        Ok(Some(disk.backing_file.clone().unwrap_or_else(|| disk.path.clone())))
    }

    fn snapshot_overlay_path(&self, disk: &DiskDesc, snapshot_id: &str) -> String {
        self.snapshot_path(disk, snapshot_id).display().to_string()
    }

    async fn delete_snapshot(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<()> {
        let path = self.snapshot_path(disk, snapshot_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "snapshot already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    async fn convert_snapshot(&self, disk: &DiskDesc, snapshot_id: &str, convert_into: &str) -> Result<()> {
        let into = self.snapshot_path(disk, convert_into);
        let tmp = into.with_extension("converting");
        let (into_s, tmp_s) = (into.display().to_string(), tmp.display().to_string());

        // reading through the chain flattens the snapshot into its dependent
        qemu_img(&["convert", "-O", "qcow2", &into_s, &tmp_s]).await?;
        tokio::fs::rename(&tmp, &into)
            .await
            .with_context(|| format!("replace {}", into.display()))?;

        self.delete_snapshot(disk, snapshot_id).await
    }

    async fn clone_disk(&self, disk: &DiskDesc, target_disk_id: &str) -> Result<String> {
        let target = self.root.join(format!("{target_disk_id}.qcow2"));
        let target_s = target.display().to_string();
        qemu_img(&["convert", "-O", "qcow2", &disk.path, &target_s]).await?;
        Ok(target_s)
    }
}
