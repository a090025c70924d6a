pub mod certs;
mod destination;
mod source;

use std::{collections::BTreeMap, future::Future, time::Duration};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::agent::{
    guest::descriptor::GuestDescriptor,
    hypervisor::{MigrationStatus, MonitorHandle},
    task::TaskHandle,
};

pub use certs::MigrateCerts;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePrepareRequest {
    #[serde(default)]
    pub live_migrate: bool,
    #[serde(default)]
    pub use_tls: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePrepareReply {
    /// disk id -> what the destination stages the disk from
    pub disks_back: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_certs: Option<MigrateCerts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestPrepareRequest {
    pub desc: GuestDescriptor,
    #[serde(default)]
    pub live_migrate: bool,
    /// disk id -> storage on this host; unlisted disks keep their storage
    #[serde(default)]
    pub target_storage_ids: BTreeMap<String, String>,
    /// Base URL of the source's memory snapshot endpoint.
    #[serde(default)]
    pub memory_snapshots_uri: Option<String>,
    #[serde(default)]
    pub src_memory_snapshots: Vec<String>,
    #[serde(default)]
    pub migrate_certs: Option<MigrateCerts>,
}

#[derive(Debug)]
pub struct DestPrepareReply {
    pub prepared_memory_snapshots: Vec<String>,
    /// Port the incoming guest listens on, for live migration.
    pub incoming_port: Option<u16>,
    pub task: Option<TaskHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMigrateRequest {
    pub dest_host: String,
    pub dest_port: u16,
    #[serde(default)]
    pub use_tls: bool,
    /// NBD endpoint on the destination for local disks; shared disks need
    /// no copy.
    #[serde(default)]
    pub mirror_target: Option<String>,
}

/// Polls the migration state until it ends. `on_progress` sees every
/// intermediate percentage.
pub(crate) async fn wait_for_migration<F, Fut>(
    monitor: &MonitorHandle,
    poll: Duration,
    timeout: Duration,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(f32) -> Fut,
    Fut: Future<Output = ()>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match monitor.migration_status().await? {
            MigrationStatus::Completed => return Ok(()),
            MigrationStatus::Failed(reason) => bail!("migration failed: {reason}"),
            MigrationStatus::Cancelled => bail!("migration cancelled"),
            MigrationStatus::Active { progress } => on_progress(progress).await,
            MigrationStatus::Setup => {}
        }

        if Instant::now() >= deadline {
            bail!("migration did not finish within {timeout:?}");
        }
        tokio::time::sleep(poll).await;
    }
}

/// Waits until the mirror job of every drive reports ready.
pub(crate) async fn wait_for_mirrors(
    monitor: &MonitorHandle,
    drives: &[String],
    poll: Duration,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let jobs = monitor.block_jobs().await?;
        let mut ready = true;
        for drive in drives {
            match jobs.iter().find(|j| &j.device == drive) {
                Some(job) => ready &= job.ready,
                None => bail!("mirror job for {drive} disappeared"),
            }
        }
        if ready {
            return Ok(());
        }

        if Instant::now() >= deadline {
            bail!("disk mirror not ready within {timeout:?}");
        }
        tokio::time::sleep(poll).await;
    }
}
