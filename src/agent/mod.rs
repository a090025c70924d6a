pub mod action_log;
pub mod block;
pub mod config_sync;
pub mod control;
pub mod control_plane;
pub mod cpuset;
pub mod error;
pub mod fetch;
pub mod forward;
pub mod guest;
pub mod hypervisor;
pub mod lifecycle;
pub mod migrate;
pub mod reconcile;
pub mod registry;
pub mod storage;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use tracing::{error, info};

use crate::{
    agent::{
        action_log::ActionLog,
        control_plane::ControlPlane,
        cpuset::{CpuApplier, CpusetBalancer},
        error::{AgentError, AgentResult},
        fetch::BlobFetcher,
        forward::ForwardClient,
        guest::{Guest, RuntimeState},
        hypervisor::{Hypervisor, MonitorHandle},
        reconcile::{BootstrapSignal, Reconciler},
        registry::{Registry, RegistryError},
        storage::StorageManager,
        task::TaskEngine,
    },
    constants::{
        DEFAULT_MIGRATE_EXPECTED_RATE_MB, DEFAULT_MIN_MIGRATE_TIMEOUT, DEFAULT_PRECOPY_POLL,
        DEFAULT_PRECOPY_TIMEOUT,
    },
    machinery::store::{Store, StoreConfig},
};

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Used to size the overall migration timeout from guest memory.
    pub expected_rate_mb: u64,
    pub min_timeout: Duration,
    pub precopy_timeout: Duration,
    pub precopy_poll: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            expected_rate_mb: DEFAULT_MIGRATE_EXPECTED_RATE_MB,
            min_timeout: DEFAULT_MIN_MIGRATE_TIMEOUT,
            precopy_timeout: DEFAULT_PRECOPY_TIMEOUT,
            precopy_poll: DEFAULT_PRECOPY_POLL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host_id: String,
    pub master_ip: String,
    pub servers_path: Option<PathBuf>,
    pub memory_snapshots_path: PathBuf,
    pub store_path: PathBuf,
    pub store_size_mib: usize,
    pub sdn_socket_path: PathBuf,
    pub enable_cpu_binding: bool,
    pub host_cores: Vec<u32>,
    pub cpuset_balance_interval: Duration,
    pub reconcile_retry: Duration,
    pub stop_timeout: Duration,
    /// Kill guests without local disks when the agent exits.
    pub stop_shared_guests_on_exit: bool,
    pub migration: MigrationSettings,
}

/// Everything the agent talks to outside its own process.
pub struct Collaborators {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub storage: Arc<StorageManager>,
    pub fetcher: Arc<dyn BlobFetcher>,
    pub cpu_applier: Arc<dyn CpuApplier>,
}

/// The guest manager of one hypervisor node. Request handlers call into it;
/// long operations are handed to the task engine.
pub struct Agent {
    config: AgentConfig,
    registry: Arc<Registry>,
    hypervisor: Arc<dyn Hypervisor>,
    control_plane: Arc<dyn ControlPlane>,
    storage: Arc<StorageManager>,
    fetcher: Arc<dyn BlobFetcher>,
    forwarder: ForwardClient,
    action_log: Arc<ActionLog>,
    tasks: Arc<TaskEngine>,
    cpuset: Arc<CpusetBalancer>,
    reconciler: Arc<Reconciler>,
}

impl Agent {
    pub async fn new(config: AgentConfig, deps: Collaborators) -> Result<Arc<Self>> {
        let store = Arc::new(
            Store::new(StoreConfig {
                dir_path: config.store_path.clone(),
                size_mib: config.store_size_mib,
            })
            .await?,
        );

        let registry = Registry::new(config.servers_path.clone(), deps.hypervisor.clone());
        let action_log = Arc::new(ActionLog::new(store.clone(), deps.control_plane.clone()));
        let tasks = TaskEngine::new(deps.control_plane.clone(), action_log.clone());

        let cpuset = CpusetBalancer::new(
            registry.clone(),
            store,
            deps.cpu_applier,
            config.host_cores.clone(),
            config.enable_cpu_binding,
            config.cpuset_balance_interval,
        );

        let reconciler = Reconciler::new(
            registry.clone(),
            deps.control_plane.clone(),
            deps.hypervisor.clone(),
            cpuset.clone(),
            action_log.clone(),
            config.host_id.clone(),
            config.reconcile_retry,
        );

        let forwarder = ForwardClient::new(&config.sdn_socket_path);

        Ok(Arc::new(Self {
            config,
            registry,
            hypervisor: deps.hypervisor,
            control_plane: deps.control_plane,
            storage: deps.storage,
            fetcher: deps.fetcher,
            forwarder,
            action_log,
            tasks,
            cpuset,
            reconciler,
        }))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn tasks(&self) -> Arc<TaskEngine> {
        self.tasks.clone()
    }

    pub fn cpuset(&self) -> Arc<CpusetBalancer> {
        self.cpuset.clone()
    }

    pub fn action_log(&self) -> Arc<ActionLog> {
        self.action_log.clone()
    }

    /// Loads guests from disk, starts reconciliation and the balancer loop.
    pub async fn bootstrap(&self) -> Result<BootstrapSignal, RegistryError> {
        let signal = self.registry.bootstrap(self.reconciler.clone()).await?;
        self.cpuset.start();
        Ok(signal)
    }

    /// Stops background work and drops control channels. Guest processes
    /// keep running and are picked up again on the next start, except guests
    /// on shared storage when `stop_shared_guests_on_exit` is set.
    pub async fn shutdown(&self) {
        self.cpuset.stop();
        if self.config.stop_shared_guests_on_exit {
            self.shutdown_shared_storage_guests().await;
        }
        for guest in self.registry.known_guests() {
            if let Some(monitor) = guest.lock().await.monitor() {
                monitor.disconnect().await;
            }
        }
        self.reconciler.wait_followups().await;
        info!("agent shut down");
    }

    /// Kills running guests that have no local disks so the control plane
    /// can bring them up on another host. Returns the ids that were stopped.
    pub async fn shutdown_shared_storage_guests(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        for guest in self.registry.known_guests() {
            let mut guard = guest.lock().await;
            let shared = guard
                .descriptor
                .as_ref()
                .is_some_and(|desc| desc.is_shared_storage());
            if !shared || !self.hypervisor.probe(guest.id()).await {
                continue;
            }

            if let Err(e) = self.hypervisor.terminate(guest.id()).await {
                error!(guest_id = guest.id(), error = %e, "failed to stop shared storage guest");
                continue;
            }
            guard.transition(RuntimeState::Stopped);
            drop(guard);
            self.registry.release_vnc_port(guest.id());
            info!(guest_id = guest.id(), "shared storage guest stopped");
            stopped.push(guest.id().to_string());
        }
        stopped
    }

    fn guest(&self, id: &str) -> AgentResult<Arc<Guest>> {
        self.registry
            .get_known(id)
            .map_err(|_| AgentError::NotFound(id.to_string()))
    }

    /// Resolves a guest that has to be running, together with its control
    /// channel handle.
    async fn running(&self, id: &str) -> AgentResult<(Arc<Guest>, Arc<MonitorHandle>)> {
        let guest = self.guest(id)?;
        let monitor = {
            let guard = guest.lock().await;
            if guard.runtime() != RuntimeState::Running {
                return Err(AgentError::precondition("guest is not running"));
            }
            guard.monitor()
        };
        let monitor = monitor.ok_or_else(|| AgentError::precondition("guest has no control channel"))?;
        Ok((guest, monitor))
    }
}
