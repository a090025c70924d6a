pub mod local;
pub mod shared;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::agent::guest::descriptor::DiskDesc;

pub use local::LocalStorage;
pub use shared::SharedStorage;

/// Which backend a disk lives on. Recorded on each disk so the agent never
/// has to guess from the path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    Shared,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    pub id: String,
    #[serde(default)]
    pub kind: StorageKind,
    pub path: PathBuf,
}

/// Context for staging one disk on a migration destination.
#[derive(Debug, Clone)]
pub struct DiskPrepareContext {
    pub guest_id: String,
    pub disk: DiskDesc,
    /// 1-based position of this disk in the request.
    pub index: usize,
    pub total: usize,
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> StorageKind;

    /// Makes the disk's backing data available locally before the guest
    /// process is started for an incoming migration.
    async fn prepare_migrate_destination(&self, ctx: &DiskPrepareContext) -> Result<()>;

    /// What the destination needs to pre-stage this disk, if anything.
    async fn disk_backing_ref(&self, disk: &DiskDesc) -> Result<Option<String>>;

    /// Path of the overlay that becomes the disk's active layer once the
    /// snapshot is taken.
    fn snapshot_overlay_path(&self, disk: &DiskDesc, snapshot_id: &str) -> String;

    async fn delete_snapshot(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<()>;

    /// Folds a snapshot into `convert_into` so that dependent layers keep a
    /// valid backing chain once the snapshot is gone.
    async fn convert_snapshot(&self, disk: &DiskDesc, snapshot_id: &str, convert_into: &str) -> Result<()>;

    /// Copies the disk and returns the path of the copy.
    async fn clone_disk(&self, disk: &DiskDesc, target_disk_id: &str) -> Result<String>;
}

/// Storage backends configured on this host, by id.
pub struct StorageManager {
    backends: papaya::HashMap<String, Arc<dyn Storage>>,
}

impl Default for StorageManager {
    fn default() -> Self {
        Self {
            backends: papaya::HashMap::new(),
        }
    }
}

impl StorageManager {
    pub fn from_config(configs: &[StorageConfig]) -> Self {
        let manager = Self::default();
        for config in configs {
            let backend: Arc<dyn Storage> = match config.kind {
                StorageKind::Local => Arc::new(LocalStorage::new(&config.id, &config.path)),
                StorageKind::Shared => Arc::new(SharedStorage::new(&config.id, &config.path)),
            };
            manager.register(backend);
        }
        manager
    }

    pub fn register(&self, backend: Arc<dyn Storage>) {
        self.backends.pin().insert(backend.id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Storage>> {
        self.backends.pin().get(id).cloned()
    }

    /// Resolves the backend a disk belongs to, checking the recorded kind.
    pub fn for_disk(&self, disk: &DiskDesc) -> Result<Arc<dyn Storage>> {
        let Some(backend) = self.get(&disk.storage_id) else {
            bail!("storage {} not found for disk {}", disk.storage_id, disk.disk_id);
        };
        if backend.kind() != disk.storage_kind {
            bail!(
                "disk {} recorded as {:?} but storage {} is {:?}",
                disk.disk_id,
                disk.storage_kind,
                disk.storage_id,
                backend.kind()
            );
        }
        Ok(backend)
    }
}

pub(crate) async fn qemu_img(args: &[&str]) -> Result<()> {
    debug!(?args, "qemu-img");
    let output = Command::new("qemu-img")
        .args(args)
        .output()
        .await
        .context("failed to execute qemu-img")?;

    if !output.status.success() {
        bail!(
            "qemu-img {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
