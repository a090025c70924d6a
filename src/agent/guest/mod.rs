pub mod descriptor;

use std::{
    collections::HashMap,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, info, warn};

use crate::{
    agent::{
        error::AgentError,
        hypervisor::{Hypervisor, MonitorEvent, MonitorHandle},
    },
    constants::DESCRIPTOR_FILE_NAME,
};

use descriptor::GuestDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Unloaded,
    Loaded,
    Starting,
    Running,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Migrating,
}

impl RuntimeState {
    /// States in which the guest process is expected to answer on its
    /// control channel.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            RuntimeState::Running
                | RuntimeState::Stopping
                | RuntimeState::Suspending
                | RuntimeState::Migrating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockJobKind {
    SnapshotCreate,
    SnapshotConvert,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockJobRecord {
    pub disk_id: String,
    pub kind: BlockJobKind,
    pub snapshot_id: Option<String>,
    pub convert_into: Option<String>,
    pub ready: bool,
}

impl BlockJobRecord {
    pub fn new(disk_id: impl Into<String>, kind: BlockJobKind) -> Self {
        Self {
            disk_id: disk_id.into(),
            kind,
            snapshot_id: None,
            convert_into: None,
            ready: false,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_convert_into(mut self, convert_into: Option<String>) -> Self {
        self.convert_into = convert_into;
        self
    }
}

/// Mutable part of a guest, only reachable through [`Guest::lock`].
pub struct GuestState {
    runtime: RuntimeState,
    monitor: Option<Arc<MonitorHandle>>,
    pub descriptor: Option<GuestDescriptor>,
    pub block_jobs: HashMap<String, BlockJobRecord>,
}

impl GuestState {
    pub fn runtime(&self) -> RuntimeState {
        self.runtime
    }

    pub fn monitor(&self) -> Option<Arc<MonitorHandle>> {
        self.monitor.clone()
    }

    pub fn descriptor(&self) -> Result<&GuestDescriptor, AgentError> {
        self.descriptor
            .as_ref()
            .ok_or_else(|| AgentError::precondition("guest has no descriptor"))
    }

    /// Registers a block job, refusing a second one on the same disk.
    pub fn begin_block_job(&mut self, record: BlockJobRecord) -> Result<(), AgentError> {
        if let Some(active) = self.block_jobs.get(&record.disk_id) {
            return Err(AgentError::precondition(format!(
                "disk {} already has an active {:?} job",
                active.disk_id, active.kind
            )));
        }
        self.block_jobs.insert(record.disk_id.clone(), record);
        Ok(())
    }

    pub fn end_block_job(&mut self, disk_id: &str) -> Option<BlockJobRecord> {
        self.block_jobs.remove(disk_id)
    }

    fn disk_for_drive(&self, drive: &str) -> Option<String> {
        self.descriptor
            .as_ref()?
            .disks
            .iter()
            .find(|d| d.drive_name() == drive)
            .map(|d| d.disk_id.clone())
    }
}

/// One VM on this host.
pub struct Guest {
    id: String,
    dir: PathBuf,
    hypervisor: Arc<dyn Hypervisor>,
    state: Mutex<GuestState>,
    staging: AtomicBool,
    this: Weak<Guest>,
}

impl std::fmt::Debug for Guest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guest").field("id", &self.id).field("dir", &self.dir).finish_non_exhaustive()
    }
}

/// Held while work on a guest runs outside its lock. Cleared on drop.
pub struct StagingGuard<'a> {
    guest: &'a Guest,
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        self.guest.staging.store(false, Ordering::SeqCst);
    }
}

impl Guest {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>, hypervisor: Arc<dyn Hypervisor>) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|this| Self {
            id,
            dir: dir.into(),
            hypervisor,
            state: Mutex::new(GuestState {
                runtime: RuntimeState::Unloaded,
                monitor: None,
                descriptor: None,
                block_jobs: HashMap::new(),
            }),
            staging: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(DESCRIPTOR_FILE_NAME)
    }

    pub async fn lock(&self) -> GuestGuard<'_> {
        GuestGuard {
            guest: self,
            state: self.state.lock().await,
        }
    }

    pub async fn runtime(&self) -> RuntimeState {
        self.state.lock().await.runtime
    }

    /// `None` while another staging is in flight.
    pub fn begin_staging(&self) -> Option<StagingGuard<'_>> {
        if self.staging.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(StagingGuard { guest: self })
    }

    pub fn is_staging(&self) -> bool {
        self.staging.load(Ordering::SeqCst)
    }

    pub async fn prepare_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create {}", self.dir.display()))
    }

    /// Forwards block-job notices from the control channel into the guest's
    /// job table. Ends when the handle is dropped.
    fn spawn_event_pump(&self, mut events: broadcast::Receiver<MonitorEvent>) {
        let guest = self.this.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "guest event pump lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(guest) = guest.upgrade() else {
                    break;
                };
                guest.on_event(event).await;
            }
        });
    }

    async fn on_event(&self, event: MonitorEvent) {
        let mut state = self.state.lock().await;
        match event {
            MonitorEvent::BlockJobReady { device } => {
                if let Some(disk_id) = state.disk_for_drive(&device) {
                    if let Some(job) = state.block_jobs.get_mut(&disk_id) {
                        job.ready = true;
                    }
                }
            }
            MonitorEvent::BlockJobCompleted { device, error } => {
                if let Some(disk_id) = state.disk_for_drive(&device) {
                    state.end_block_job(&disk_id);
                    match error {
                        Some(error) => warn!(guest_id = %self.id, %disk_id, %error, "block job failed"),
                        None => info!(guest_id = %self.id, %disk_id, "block job completed"),
                    }
                }
            }
            MonitorEvent::BlockJobCancelled { device } => {
                if let Some(disk_id) = state.disk_for_drive(&device) {
                    state.end_block_job(&disk_id);
                    info!(guest_id = %self.id, %disk_id, "block job cancelled");
                }
            }
            MonitorEvent::Shutdown => debug!(guest_id = %self.id, "guest reported shutdown"),
            MonitorEvent::Other(_) => {}
        }
    }
}

/// Exclusive access to a guest's state. State changes go through
/// [`GuestGuard::transition`] so the control-channel handle exists exactly
/// while the state is a monitored one.
pub struct GuestGuard<'a> {
    guest: &'a Guest,
    state: MutexGuard<'a, GuestState>,
}

impl GuestGuard<'_> {
    pub fn transition(&mut self, to: RuntimeState) {
        let from = self.state.runtime;
        if to.is_monitored() {
            if self.state.monitor.is_none() {
                let handle = MonitorHandle::new(self.guest.id.clone(), self.guest.hypervisor.clone());
                self.guest.spawn_event_pump(handle.subscribe());
                self.state.monitor = Some(handle);
            }
        } else {
            self.state.monitor = None;
        }
        self.state.runtime = to;

        if from != to {
            debug!(guest_id = %self.guest.id, ?from, ?to, "state transition");
        }
    }

    pub fn state_mut(&mut self) -> &mut GuestState {
        &mut self.state
    }

    /// Replaces the descriptor and writes it through to disk.
    pub async fn save_descriptor(&mut self, desc: GuestDescriptor) -> Result<()> {
        desc.save(self.guest.descriptor_path()).await?;
        self.state.descriptor = Some(desc);
        Ok(())
    }

    /// Applies `f` to the descriptor and persists the result.
    pub async fn update_descriptor(&mut self, f: impl FnOnce(&mut GuestDescriptor)) -> Result<(), AgentError> {
        let mut desc = self.state.descriptor()?.clone();
        f(&mut desc);
        self.save_descriptor(desc).await?;
        Ok(())
    }
}

impl Deref for GuestGuard<'_> {
    type Target = GuestState;

    fn deref(&self) -> &GuestState {
        &self.state
    }
}
