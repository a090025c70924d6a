pub mod qemu;
pub mod qmp;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::agent::guest::descriptor::GuestDescriptor;

#[derive(Debug, Clone, Error)]
pub enum MonitorError {
    #[error("monitor disconnected")]
    Disconnected,

    #[error("command failed: {desc} ({class})")]
    Command { class: String, desc: String },

    #[error("command timed out")]
    Timeout,

    #[error("monitor io: {0}")]
    Io(String),

    #[error("unexpected reply: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorSync {
    Top,
    Full,
}

/// Commands the agent issues over a guest's control channel. Adapters map
/// these onto whatever the hypervisor speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorCommand {
    Human(String),
    QueryStatus,
    Pause,
    Resume,
    Powerdown,
    Quit,
    QueryBlockJobs,
    SnapshotBlkdev { drive: String, overlay: String },
    DriveMirror { drive: String, target: String, sync: MirrorSync },
    BlockJobCancel { drive: String },
    BlockResize { drive: String, size_mb: u64 },
    IoThrottle { drive: String, bps: u64, iops: u64 },
    ReopenDrive { drive: String, path: String },
    HotplugVcpu { index: u32 },
    HotplugMemory { id: String, size_mb: u64 },
    /// `tls_dir` holds the x509 material when the channel is secured.
    Migrate { uri: String, tls_dir: Option<String> },
    QueryMigrate,
    MigrateCancel,
    SaveMemory { path: String },
    AnnounceSelf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    BlockJobReady { device: String },
    BlockJobCompleted { device: String, error: Option<String> },
    BlockJobCancelled { device: String },
    Shutdown,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Paused,
    Shutdown,
    Inmigrate,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockJobInfo {
    pub device: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub len: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStatus {
    Setup,
    Active { progress: f32 },
    Completed,
    Failed(String),
    Cancelled,
}

/// One live control connection to a guest's hypervisor process.
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn execute(&self, command: MonitorCommand) -> Result<Value, MonitorError>;

    fn subscribe(&self) -> broadcast::Receiver<MonitorEvent>;

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOptions {
    pub vnc_port: u16,
    /// Listen address when the guest is the destination of a live migration.
    pub incoming: Option<String>,
    pub tls_dir: Option<PathBuf>,
}

/// Process-level control of guests, kept separate from the per-guest channel.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn probe(&self, guest_id: &str) -> bool;

    async fn launch(
        &self,
        guest_id: &str,
        desc: &GuestDescriptor,
        opts: &LaunchOptions,
    ) -> anyhow::Result<()>;

    async fn connect(&self, guest_id: &str) -> Result<Arc<dyn Monitor>, MonitorError>;

    async fn terminate(&self, guest_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Absent,
    Connecting,
    Connected,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelState::Connecting,
            2 => ChannelState::Connected,
            _ => ChannelState::Absent,
        }
    }
}

/// Handle to a guest's control channel. The handle exists while the guest is
/// in a monitored state; the connection behind it comes and goes and is
/// re-established on demand.
pub struct MonitorHandle {
    guest_id: String,
    hypervisor: Arc<dyn Hypervisor>,
    channel: Mutex<Option<Arc<dyn Monitor>>>,
    state: AtomicU8,
    events: broadcast::Sender<MonitorEvent>,
    relay: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    pub fn new(guest_id: impl Into<String>, hypervisor: Arc<dyn Hypervisor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            guest_id: guest_id.into(),
            hypervisor,
            channel: Mutex::new(None),
            state: AtomicU8::new(ChannelState::Absent as u8),
            events,
            relay: std::sync::Mutex::new(None),
        })
    }

    pub fn guest_id(&self) -> &str {
        &self.guest_id
    }

    pub fn channel_state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Events survive reconnects; subscribers keep their receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Returns the live channel, connecting first when there is none.
    pub async fn channel(&self) -> Result<Arc<dyn Monitor>, MonitorError> {
        let mut channel = self.channel.lock().await;
        if let Some(monitor) = channel.as_ref() {
            if !monitor.is_closed() {
                return Ok(monitor.clone());
            }
            debug!(guest_id = %self.guest_id, "monitor channel closed, reconnecting");
        }

        self.set_state(ChannelState::Connecting);
        match self.hypervisor.connect(&self.guest_id).await {
            Ok(monitor) => {
                self.start_relay(monitor.subscribe());
                *channel = Some(monitor.clone());
                self.set_state(ChannelState::Connected);
                Ok(monitor)
            }
            Err(e) => {
                *channel = None;
                self.set_state(ChannelState::Absent);
                warn!(guest_id = %self.guest_id, error = %e, "monitor connect failed");
                Err(e)
            }
        }
    }

    fn start_relay(&self, mut rx: broadcast::Receiver<MonitorEvent>) {
        let tx = self.events.clone();
        let relay = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "monitor event relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut slot) = self.relay.lock() {
            if let Some(old) = slot.replace(relay) {
                old.abort();
            }
        }
    }

    pub async fn execute(&self, command: MonitorCommand) -> Result<Value, MonitorError> {
        let monitor = self.channel().await?;
        let result = monitor.execute(command).await;

        if matches!(result, Err(MonitorError::Disconnected)) {
            let mut channel = self.channel.lock().await;
            *channel = None;
            self.set_state(ChannelState::Absent);
        }

        result
    }

    /// Drops the live connection without touching the guest. The next
    /// command reconnects.
    pub async fn disconnect(&self) {
        let mut channel = self.channel.lock().await;
        if channel.take().is_some() {
            debug!(guest_id = %self.guest_id, "monitor channel dropped");
        }
        self.set_state(ChannelState::Absent);
        if let Ok(mut slot) = self.relay.lock() {
            if let Some(relay) = slot.take() {
                relay.abort();
            }
        }
    }

    pub async fn status(&self) -> Result<RunStatus, MonitorError> {
        let ret = self.execute(MonitorCommand::QueryStatus).await?;
        let status = ret["status"]
            .as_str()
            .ok_or_else(|| MonitorError::Protocol(format!("query-status: {ret}")))?;

        Ok(match status {
            "running" => RunStatus::Running,
            "paused" => RunStatus::Paused,
            "shutdown" => RunStatus::Shutdown,
            "inmigrate" => RunStatus::Inmigrate,
            other => RunStatus::Other(other.to_string()),
        })
    }

    pub async fn block_jobs(&self) -> Result<Vec<BlockJobInfo>, MonitorError> {
        let ret = self.execute(MonitorCommand::QueryBlockJobs).await?;
        serde_json::from_value(ret).map_err(|e| MonitorError::Protocol(e.to_string()))
    }

    pub async fn migration_status(&self) -> Result<MigrationStatus, MonitorError> {
        let ret = self.execute(MonitorCommand::QueryMigrate).await?;
        Ok(parse_migration_status(&ret))
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.relay.lock() {
            if let Some(relay) = slot.take() {
                relay.abort();
            }
        }
    }
}

pub fn parse_migration_status(ret: &Value) -> MigrationStatus {
    match ret["status"].as_str().unwrap_or("setup") {
        "active" | "pre-switchover" | "device" | "postcopy-active" => {
            let total = ret["ram"]["total"].as_u64().unwrap_or(0);
            let transferred = ret["ram"]["transferred"].as_u64().unwrap_or(0);
            let progress = if total == 0 {
                0.0
            } else {
                (transferred as f32 / total as f32 * 100.0).min(99.0)
            };
            MigrationStatus::Active { progress }
        }
        "completed" => MigrationStatus::Completed,
        "failed" => MigrationStatus::Failed(
            ret["error-desc"]
                .as_str()
                .unwrap_or("migration failed")
                .to_string(),
        ),
        "cancelled" | "cancelling" => MigrationStatus::Cancelled,
        _ => MigrationStatus::Setup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{FakeHypervisor, FakeMonitor};
    use serde_json::json;

    #[test]
    fn test_parse_migration_status() {
        assert_eq!(
            parse_migration_status(&json!({"status": "active", "ram": {"total": 200, "transferred": 50}})),
            MigrationStatus::Active { progress: 25.0 }
        );
        assert_eq!(
            parse_migration_status(&json!({"status": "completed"})),
            MigrationStatus::Completed
        );
        assert_eq!(
            parse_migration_status(&json!({"status": "failed", "error-desc": "boom"})),
            MigrationStatus::Failed("boom".to_string())
        );
    }

    #[tokio::test]
    async fn test_handle_connects_lazily() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let handle = MonitorHandle::new("g-1", hypervisor.clone());
        assert_eq!(handle.channel_state(), ChannelState::Absent);
        assert_eq!(hypervisor.connects(), 0);

        handle.status().await.unwrap();
        assert_eq!(handle.channel_state(), ChannelState::Connected);

        handle.status().await.unwrap();
        assert_eq!(hypervisor.connects(), 1);
    }

    #[tokio::test]
    async fn test_handle_reconnects_after_close() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let handle = MonitorHandle::new("g-1", hypervisor.clone());

        handle.status().await.unwrap();
        hypervisor.monitor("g-1").close();

        handle.status().await.unwrap();
        assert_eq!(hypervisor.connects(), 2);
    }

    #[tokio::test]
    async fn test_handle_relays_events_across_reconnect() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let handle = MonitorHandle::new("g-1", hypervisor.clone());
        let mut events = handle.subscribe();

        handle.channel().await.unwrap();
        let first: Arc<FakeMonitor> = hypervisor.monitor("g-1");
        first.emit(MonitorEvent::BlockJobReady {
            device: "drive_0".to_string(),
        });
        assert_eq!(
            events.recv().await.unwrap(),
            MonitorEvent::BlockJobReady {
                device: "drive_0".to_string()
            }
        );

        first.close();
        handle.channel().await.unwrap();
        hypervisor.monitor("g-1").emit(MonitorEvent::Shutdown);
        assert_eq!(events.recv().await.unwrap(), MonitorEvent::Shutdown);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_channel_absent() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        hypervisor.fail_connect(true);
        let handle = MonitorHandle::new("g-1", hypervisor.clone());

        assert!(handle.channel().await.is_err());
        assert_eq!(handle.channel_state(), ChannelState::Absent);
    }
}
