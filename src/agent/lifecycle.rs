use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    agent::{
        Agent,
        error::{AgentError, AgentResult},
        guest::{BlockJobKind, Guest, RuntimeState, descriptor::GuestDescriptor},
        hypervisor::{LaunchOptions, MonitorCommand},
        task::{TaskHandle, TaskKind, TaskOutcome},
    },
    constants::MIGRATE_CERTS_DIR_NAME,
};

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_BLOCK_STREAM: &str = "block_stream";
pub const STATUS_BLOCK_STREAM_FAIL: &str = "block_stream_fail";
pub const STATUS_SUSPEND: &str = "suspend";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_NOT_FOUND: &str = "notfound";

const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct StartReply {
    pub vnc_port: u16,
    /// The guest was already running; nothing was launched.
    pub is_running: bool,
    pub task: Option<TaskHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_jobs_count: Option<usize>,
}

impl Agent {
    /// Registers a new guest. With a descriptor the instance directory is
    /// prepared and the descriptor written before this returns.
    pub async fn create_guest(&self, id: &str, desc: Option<GuestDescriptor>) -> AgentResult<Arc<Guest>> {
        let guest = self.registry.create(id).await?;
        if let Err(e) = Self::materialize(&guest, desc).await {
            if let Err(rollback) = self.registry.delete(id).await {
                warn!(guest_id = id, error = %rollback, "failed to roll back guest registration");
            }
            return Err(e);
        }

        info!(guest_id = id, "guest created");
        Ok(guest)
    }

    async fn materialize(guest: &Guest, desc: Option<GuestDescriptor>) -> AgentResult<()> {
        guest.prepare_dir().await?;
        if let Some(desc) = desc {
            let mut guard = guest.lock().await;
            guard.save_descriptor(desc).await?;
            guard.transition(RuntimeState::Loaded);
        }
        Ok(())
    }

    pub async fn deploy(&self, id: &str, desc: Option<GuestDescriptor>) -> AgentResult<()> {
        let guest = self.guest(id)?;
        let mut guard = guest.lock().await;
        if matches!(guard.runtime(), RuntimeState::Running | RuntimeState::Suspended) {
            return Err(AgentError::precondition("cannot deploy on running/suspend guest"));
        }

        guest.prepare_dir().await?;
        if let Some(desc) = desc {
            guard.save_descriptor(desc).await?;
        }
        guard.descriptor()?;

        if guard.runtime() == RuntimeState::Unloaded {
            guard.transition(RuntimeState::Loaded);
        }
        info!(guest_id = id, "guest deployed");
        Ok(())
    }

    /// Launches a loaded or stopped guest. A running guest answers with its
    /// current VNC port instead.
    pub async fn start(self: &Arc<Self>, id: &str, desc: Option<GuestDescriptor>) -> AgentResult<StartReply> {
        let guest = self.guest(id)?;
        let mut guard = guest.lock().await;
        if guest.is_staging() {
            return Err(AgentError::precondition("guest is being staged for migration"));
        }

        match guard.runtime() {
            RuntimeState::Loaded | RuntimeState::Stopped => {}
            RuntimeState::Running => {
                return match guard.descriptor()?.vnc_port {
                    Some(vnc_port) => Ok(StartReply {
                        vnc_port,
                        is_running: true,
                        task: None,
                    }),
                    None => Err(AgentError::precondition("guest seems started but has no vnc port")),
                };
            }
            other => {
                return Err(AgentError::precondition(format!(
                    "cannot start guest while {other:?}"
                )));
            }
        }

        if let Some(desc) = desc {
            guard.save_descriptor(desc).await?;
        }
        guard.descriptor()?;

        let vnc_port = self.registry.free_vnc_port(id)?;
        if let Err(e) = guard.update_descriptor(|d| d.vnc_port = Some(vnc_port)).await {
            self.registry.release_vnc_port(id);
            return Err(e);
        }
        let desc = guard.descriptor()?.clone();
        guard.transition(RuntimeState::Starting);
        drop(guard);

        let opts = LaunchOptions {
            vnc_port,
            ..Default::default()
        };
        let task = self.launch(guest, desc, opts, TaskKind::Start, RuntimeState::Running);

        Ok(StartReply {
            vnc_port,
            is_running: false,
            task: Some(task),
        })
    }

    /// Runs the hypervisor launch as a task. The guest settles in `settled`
    /// on success and in `Stopped` on failure.
    pub(crate) fn launch(
        self: &Arc<Self>,
        guest: Arc<Guest>,
        desc: GuestDescriptor,
        opts: LaunchOptions,
        kind: TaskKind,
        settled: RuntimeState,
    ) -> TaskHandle {
        let id = guest.id().to_string();
        let hypervisor = self.hypervisor.clone();
        let registry = self.registry.clone();

        let work = {
            let id = id.clone();
            async move {
                hypervisor.launch(&id, &desc, &opts).await?;
                anyhow::Ok(json!({ "vnc_port": opts.vnc_port }))
            }
        };

        self.tasks.spawn(kind, id, work, move |outcome: TaskOutcome| async move {
            let mut guard = guest.lock().await;
            if outcome.is_success() {
                guard.transition(settled);
            } else {
                guard.transition(RuntimeState::Stopped);
                registry.release_vnc_port(guest.id());
            }
        })
    }

    /// Asks the guest to power down and kills it once `timeout` passes.
    pub async fn stop(self: &Arc<Self>, id: &str, timeout: Option<Duration>) -> AgentResult<TaskHandle> {
        let guest = self.guest(id)?;
        let mut guard = guest.lock().await;
        if guard.runtime() != RuntimeState::Running {
            return Err(AgentError::precondition("guest is not running"));
        }
        guard.transition(RuntimeState::Stopping);
        let monitor = guard.monitor();
        drop(guard);

        let timeout = timeout.unwrap_or(self.config.stop_timeout);
        let hypervisor = self.hypervisor.clone();
        let registry = self.registry.clone();

        let work = {
            let id = id.to_string();
            async move {
                if let Some(monitor) = monitor {
                    if let Err(e) = monitor.execute(MonitorCommand::Powerdown).await {
                        warn!(guest_id = %id, error = %e, "powerdown request failed");
                    }
                }

                let deadline = Instant::now() + timeout;
                while hypervisor.probe(&id).await && Instant::now() < deadline {
                    tokio::time::sleep(STOP_POLL).await;
                }

                let forced = hypervisor.probe(&id).await;
                if forced {
                    warn!(guest_id = %id, ?timeout, "guest ignored powerdown, terminating");
                    hypervisor.terminate(&id).await?;
                }
                anyhow::Ok(json!({ "forced": forced }))
            }
        };

        Ok(self.tasks.spawn(TaskKind::Stop, id, work, move |outcome: TaskOutcome| async move {
            let mut guard = guest.lock().await;
            if outcome.is_success() {
                guard.transition(RuntimeState::Stopped);
                registry.release_vnc_port(guest.id());
            } else {
                guard.transition(RuntimeState::Running);
            }
        }))
    }

    pub async fn suspend(self: &Arc<Self>, id: &str) -> AgentResult<TaskHandle> {
        let guest = self.guest(id)?;
        let mut guard = guest.lock().await;
        if guard.runtime() != RuntimeState::Running {
            return Err(AgentError::precondition("guest is not running"));
        }
        guard.transition(RuntimeState::Suspending);
        let monitor = guard
            .monitor()
            .ok_or_else(|| AgentError::precondition("guest has no control channel"))?;
        drop(guard);

        let work = async move {
            monitor.execute(MonitorCommand::Pause).await?;
            anyhow::Ok(json!({}))
        };

        Ok(self.tasks.spawn(TaskKind::Suspend, id, work, move |outcome: TaskOutcome| async move {
            let mut guard = guest.lock().await;
            guard.transition(if outcome.is_success() {
                RuntimeState::Suspended
            } else {
                RuntimeState::Running
            });
        }))
    }

    /// Resumes a paused guest. After a live migration the guest announces
    /// itself on the network first; `clean_tls` drops the migration
    /// certificates once the guest runs.
    pub async fn resume(self: &Arc<Self>, id: &str, live_migrate: bool, clean_tls: bool) -> AgentResult<TaskHandle> {
        let guest = self.guest(id)?;
        let mut guard = guest.lock().await;
        match guard.runtime() {
            RuntimeState::Suspended | RuntimeState::Running | RuntimeState::Migrating => {}
            RuntimeState::Stopping | RuntimeState::Stopped => {
                return Err(AgentError::precondition("cannot resume stopped guest"));
            }
            other => {
                return Err(AgentError::precondition(format!(
                    "cannot resume guest while {other:?}"
                )));
            }
        }

        // the channel is (re)connected lazily by the first command
        let previous = guard.runtime();
        guard.transition(RuntimeState::Running);
        let monitor = guard
            .monitor()
            .ok_or_else(|| AgentError::precondition("guest has no control channel"))?;
        drop(guard);

        let certs_dir = guest.dir().join(MIGRATE_CERTS_DIR_NAME);
        let work = {
            let id = id.to_string();
            async move {
                if live_migrate {
                    if let Err(e) = monitor.execute(MonitorCommand::AnnounceSelf).await {
                        warn!(guest_id = %id, error = %e, "announce after migration failed");
                    }
                }
                monitor.execute(MonitorCommand::Resume).await?;

                if clean_tls {
                    match tokio::fs::remove_dir_all(&certs_dir).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(guest_id = %id, error = %e, "failed to remove migration certs"),
                    }
                }
                anyhow::Ok(json!({}))
            }
        };

        Ok(self.tasks.spawn(TaskKind::Resume, id, work, move |outcome: TaskOutcome| async move {
            if !outcome.is_success() {
                guest.lock().await.transition(previous);
            }
        }))
    }

    pub async fn status(&self, id: &str) -> &'static str {
        let Ok(guest) = self.registry.get_known(id) else {
            return STATUS_NOT_FOUND;
        };
        let runtime = guest.runtime().await;
        if runtime.is_monitored() {
            STATUS_RUNNING
        } else if runtime == RuntimeState::Suspended {
            STATUS_SUSPEND
        } else {
            STATUS_STOPPED
        }
    }

    /// Status plus the number of block jobs the hypervisor reports. A mirror
    /// the agent tracks but the hypervisor lost is reported as failed.
    pub async fn status_with_block_jobs(&self, id: &str) -> AgentResult<GuestStatus> {
        let status = self.status(id).await;
        if status != STATUS_RUNNING {
            return Ok(GuestStatus {
                status,
                block_jobs_count: None,
            });
        }

        let guest = self.guest(id)?;
        let (monitor, mirrors) = {
            let guard = guest.lock().await;
            let mirrors: Vec<String> = guard
                .block_jobs
                .values()
                .filter(|job| job.kind == BlockJobKind::Mirror)
                .map(|job| job.disk_id.clone())
                .collect();
            (guard.monitor(), mirrors)
        };
        let Some(monitor) = monitor else {
            return Ok(GuestStatus {
                status,
                block_jobs_count: None,
            });
        };

        let jobs = monitor.block_jobs().await?;
        let mut status = status;
        if !mirrors.is_empty() {
            let mut guard = guest.lock().await;
            let drives: Vec<(String, String)> = match guard.descriptor.as_ref() {
                Some(desc) => mirrors
                    .iter()
                    .filter_map(|disk_id| desc.disk(disk_id).map(|d| (disk_id.clone(), d.drive_name())))
                    .collect(),
                None => Vec::new(),
            };
            let missing: Vec<&String> = drives
                .iter()
                .filter(|(_, drive)| !jobs.iter().any(|j| &j.device == drive))
                .map(|(disk_id, _)| disk_id)
                .collect();

            if missing.is_empty() {
                status = STATUS_BLOCK_STREAM;
            } else {
                for disk_id in missing {
                    warn!(guest_id = id, %disk_id, "mirror job missing");
                    guard.state_mut().end_block_job(disk_id);
                }
                status = STATUS_BLOCK_STREAM_FAIL;
            }
        }

        Ok(GuestStatus {
            status,
            block_jobs_count: Some(jobs.len()),
        })
    }

    /// Forgets a guest that is not running and removes its directory.
    pub async fn delete_guest(&self, id: &str) -> AgentResult<()> {
        let guest = self.guest(id)?;
        if guest.runtime().await.is_monitored() {
            return Err(AgentError::precondition("cannot delete running guest"));
        }
        if guest.is_staging() {
            return Err(AgentError::precondition("guest is being staged for migration"));
        }
        self.registry.delete(id).await?;

        match tokio::fs::remove_dir_all(guest.dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow::Error::new(e).context("remove guest dir").into()),
        }
        if let Err(e) = self.cpuset.release(id).await {
            warn!(guest_id = id, error = %e, "failed to release cpuset");
        }
        match self.action_log.purge(id) {
            Ok(purged) => debug!(guest_id = id, purged, "action journal purged"),
            Err(e) => warn!(guest_id = id, error = %e, "failed to purge action journal"),
        }
        info!(guest_id = id, "guest deleted");
        Ok(())
    }
}
