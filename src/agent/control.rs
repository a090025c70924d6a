use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{
    Agent,
    action_log::ActionLogEntry,
    error::{AgentError, AgentResult},
    forward::{CloseRequest, Forward, ListByRemoteRequest, OpenRequest, Proto},
    guest::{RuntimeState, descriptor::GuestDescriptor},
    hypervisor::{LaunchOptions, MonitorCommand, MonitorHandle},
    migrate::wait_for_migration,
    task::{TaskHandle, TaskKind, TaskOutcome},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenForwardRequest {
    pub proto: Proto,
    /// Guest address to forward to; the guest's VPC address when unset.
    #[serde(default)]
    pub addr: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseForwardRequest {
    pub proto: Proto,
    pub proxy_addr: String,
    pub proxy_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListForwardsRequest {
    #[serde(default)]
    pub proto: Option<Proto>,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// A port forward as seen from the guest: `addr:port` inside the VPC is
/// reachable on `proxy_addr:proxy_port` of the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardInfo {
    pub proto: Proto,
    pub addr: String,
    pub port: u16,
    pub proxy_addr: String,
    pub proxy_port: u16,
}

impl From<Forward> for ForwardInfo {
    fn from(f: Forward) -> Self {
        Self {
            proto: f.proto,
            addr: f.remote_addr,
            port: f.remote_port,
            proxy_addr: f.bind_addr,
            proxy_port: f.bind_port,
        }
    }
}

/// (net id, guest address) of the guest's VPC interface.
fn vpc_endpoint(desc: &GuestDescriptor) -> AgentResult<(String, String)> {
    let nic = desc
        .vpc_nic()
        .ok_or_else(|| AgentError::precondition("guest has no vpc nic"))?;
    let net_id = nic
        .net_id
        .clone()
        .ok_or_else(|| AgentError::precondition("vpc nic has no network id"))?;
    Ok((net_id, nic.ip.clone()))
}

impl Agent {
    /// Passes a human monitor command through and returns its output.
    pub async fn monitor_command(&self, id: &str, command: &str) -> AgentResult<String> {
        let (_, monitor) = self.running(id).await?;
        let ret = monitor.execute(MonitorCommand::Human(command.to_string())).await?;
        Ok(match ret {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    pub async fn io_throttle(&self, id: &str, bps: u64, iops: u64) -> AgentResult<()> {
        let (guest, monitor) = self.running(id).await?;
        let drives: Vec<String> = {
            let guard = guest.lock().await;
            guard.descriptor()?.disks.iter().map(|d| d.drive_name()).collect()
        };

        for drive in drives {
            monitor
                .execute(MonitorCommand::IoThrottle { drive, bps, iops })
                .await?;
        }
        info!(guest_id = id, bps, iops, "io throttle set");
        Ok(())
    }

    pub async fn online_resize_disk(&self, id: &str, disk_id: &str, size_mb: u64) -> AgentResult<()> {
        let (guest, monitor) = self.running(id).await?;
        let drive = {
            let guard = guest.lock().await;
            let disk = guard
                .descriptor()?
                .disk(disk_id)
                .ok_or_else(|| AgentError::precondition(format!("disk {disk_id} not found")))?;
            if size_mb < disk.size_mb {
                return Err(AgentError::precondition("disk can only grow"));
            }
            disk.drive_name()
        };

        monitor
            .execute(MonitorCommand::BlockResize { drive, size_mb })
            .await?;

        let mut guard = guest.lock().await;
        guard
            .update_descriptor(|d| {
                if let Some(disk) = d.disk_mut(disk_id) {
                    disk.size_mb = size_mb;
                }
            })
            .await?;
        info!(guest_id = id, %disk_id, size_mb, "disk resized");
        Ok(())
    }

    /// Adds vCPUs and memory to a running guest.
    pub async fn hotplug_cpu_mem(self: &Arc<Self>, id: &str, add_cpu: u32, add_mem_mb: u64) -> AgentResult<TaskHandle> {
        let (guest, monitor) = self.running(id).await?;
        let (cpu, target_cpu, target_mem_mb) = {
            let guard = guest.lock().await;
            let desc = guard.descriptor()?;
            let target_cpu = desc
                .cpu
                .checked_add(add_cpu)
                .ok_or_else(|| AgentError::precondition(format!("cannot add {add_cpu} vcpus to {}", desc.cpu)))?;
            let target_mem_mb = desc
                .mem_mb
                .checked_add(add_mem_mb)
                .ok_or_else(|| AgentError::precondition(format!("cannot add {add_mem_mb}MB to {}MB", desc.mem_mb)))?;
            (desc.cpu, target_cpu, target_mem_mb)
        };

        let work = async move {
            for index in cpu..target_cpu {
                monitor.execute(MonitorCommand::HotplugVcpu { index }).await?;
            }
            if add_mem_mb > 0 {
                let mem_id = format!("mem-{}", Uuid::new_v4().simple());
                monitor
                    .execute(MonitorCommand::HotplugMemory {
                        id: mem_id,
                        size_mb: add_mem_mb,
                    })
                    .await?;
            }

            let mut guard = guest.lock().await;
            guard
                .update_descriptor(|d| {
                    d.cpu = target_cpu;
                    d.mem_mb = target_mem_mb;
                })
                .await?;
            let desc = guard.descriptor()?;
            anyhow::Ok(json!({ "cpu": desc.cpu, "mem_mb": desc.mem_mb }))
        };

        Ok(self.tasks.spawn(TaskKind::Hotplug, id, work, |_| async {}))
    }

    /// Copies a disk onto another storage and points the descriptor at the
    /// copy. The guest must not be running.
    pub async fn storage_clone_disk(
        self: &Arc<Self>,
        id: &str,
        disk_id: &str,
        target_storage_id: &str,
        target_disk_id: &str,
    ) -> AgentResult<TaskHandle> {
        let guest = self.guest(id)?;
        let disk = {
            let guard = guest.lock().await;
            if matches!(guard.runtime(), RuntimeState::Running | RuntimeState::Suspended) {
                return Err(AgentError::precondition(
                    "cannot change disk storage on running/suspend guest",
                ));
            }
            guard
                .descriptor()?
                .disk(disk_id)
                .cloned()
                .ok_or_else(|| AgentError::precondition(format!("disk {disk_id} not found")))?
        };
        let target = self
            .storage
            .get(target_storage_id)
            .ok_or_else(|| AgentError::Storage(format!("storage {target_storage_id} not found")))?;

        let disk_id = disk_id.to_string();
        let target_disk_id = target_disk_id.to_string();
        let work = async move {
            let path = target.clone_disk(&disk, &target_disk_id).await?;

            let mut guard = guest.lock().await;
            guard
                .update_descriptor(|d| {
                    if let Some(disk) = d.disk_mut(&disk_id) {
                        disk.disk_id = target_disk_id.clone();
                        disk.path = path.clone();
                        disk.storage_id = target.id().to_string();
                        disk.storage_kind = target.kind();
                        disk.backing_file = None;
                    }
                })
                .await?;
            anyhow::Ok(json!({ "disk_id": target_disk_id, "path": path }))
        };

        Ok(self.tasks.spawn(TaskKind::CloneDisk, id, work, |_| async {}))
    }

    /// Makes a running guest pick up a disk image that changed under it.
    pub async fn reload_disk_snapshot(&self, id: &str, disk_id: &str) -> AgentResult<()> {
        let (guest, monitor) = self.running(id).await?;
        let (drive, path) = {
            let guard = guest.lock().await;
            let disk = guard
                .descriptor()?
                .disk(disk_id)
                .ok_or_else(|| AgentError::precondition(format!("disk {disk_id} not found")))?;
            (disk.drive_name(), disk.path.clone())
        };

        monitor
            .execute(MonitorCommand::ReopenDrive { drive, path })
            .await?;
        Ok(())
    }

    pub fn memory_snapshot_path(&self, guest_id: &str, snapshot_id: &str) -> PathBuf {
        self.config
            .memory_snapshots_path
            .join(guest_id)
            .join(snapshot_id)
    }

    /// Saves the memory of a running guest. The guest is paused while the
    /// image is written and resumed afterwards, also when saving failed.
    pub async fn memory_snapshot(self: &Arc<Self>, id: &str, snapshot_id: &str) -> AgentResult<TaskHandle> {
        let (_, monitor) = self.running(id).await?;
        let path = self.memory_snapshot_path(id, snapshot_id);
        let poll = self.config.migration.precopy_poll;
        let timeout = self.config.migration.precopy_timeout;

        let work = {
            let id = id.to_string();
            async move {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                monitor.execute(MonitorCommand::Pause).await?;
                let saved = async {
                    monitor
                        .execute(MonitorCommand::SaveMemory {
                            path: path.to_string_lossy().into_owned(),
                        })
                        .await?;
                    wait_for_migration(&monitor, poll, timeout, |_| async {}).await
                }
                .await;

                if let Err(e) = monitor.execute(MonitorCommand::Resume).await {
                    warn!(guest_id = %id, error = %e, "resume after memory snapshot failed");
                }
                saved?;

                let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                anyhow::Ok(json!({ "path": path, "size": size }))
            }
        };

        Ok(self.tasks.spawn(TaskKind::MemorySnapshot, id, work, |_| async {}))
    }

    pub async fn delete_memory_snapshot(&self, guest_id: &str, snapshot_id: &str) -> AgentResult<()> {
        let path = self.memory_snapshot_path(guest_id, snapshot_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(%guest_id, %snapshot_id, "memory snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("remove memory snapshot").into()),
        }
    }

    /// Boots a stopped guest from a saved memory image. The process starts
    /// paused on the image and is resumed once loaded; a guest that loads
    /// but cannot be resumed is killed again.
    pub async fn reset_memory_snapshot(self: &Arc<Self>, id: &str, snapshot_id: &str) -> AgentResult<TaskHandle> {
        let guest = self.guest(id)?;
        let path = self.memory_snapshot_path(id, snapshot_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AgentError::precondition(format!("memory snapshot {snapshot_id} not found")));
        }

        let mut guard = guest.lock().await;
        if !matches!(guard.runtime(), RuntimeState::Loaded | RuntimeState::Stopped) {
            return Err(AgentError::precondition(format!(
                "cannot reset memory while {:?}",
                guard.runtime()
            )));
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
            incoming: Some(format!("exec:cat {}", path.display())),
            tls_dir: None,
        };
        let hypervisor = self.hypervisor.clone();
        let registry = self.registry.clone();

        let work = {
            let id = id.to_string();
            let snapshot_id = snapshot_id.to_string();
            async move {
                hypervisor.launch(&id, &desc, &opts).await?;
                let monitor = MonitorHandle::new(&id, hypervisor.clone());
                let resumed = monitor.execute(MonitorCommand::Resume).await;
                monitor.disconnect().await;
                if let Err(e) = resumed {
                    warn!(guest_id = %id, error = %e, "guest loaded memory but did not resume");
                    hypervisor.terminate(&id).await?;
                    return Err(e.into());
                }
                anyhow::Ok(json!({ "snapshot_id": snapshot_id, "vnc_port": vnc_port }))
            }
        };

        Ok(self.tasks.spawn(TaskKind::MemorySnapshotReset, id, work, move |outcome: TaskOutcome| async move {
            let mut guard = guest.lock().await;
            if outcome.is_success() {
                guard.transition(RuntimeState::Running);
            } else {
                guard.transition(RuntimeState::Stopped);
                registry.release_vnc_port(guest.id());
            }
        }))
    }

    /// Pins a guest to `cores`; the balancer leaves it alone afterwards.
    pub async fn cpu_set(&self, id: &str, cores: Vec<u32>) -> AgentResult<()> {
        self.guest(id)?;
        if cores.is_empty() {
            return Err(AgentError::precondition("no cores given"));
        }
        if let Some(bad) = cores.iter().find(|c| !self.config.host_cores.contains(c)) {
            return Err(AgentError::precondition(format!("core {bad} not on this host")));
        }
        self.cpuset.set_manual(id, cores).await?;
        Ok(())
    }

    pub async fn cpu_set_remove(&self, id: &str) -> AgentResult<()> {
        self.guest(id)?;
        self.cpuset.remove_manual(id).await?;
        Ok(())
    }

    /// Runs one balancing pass now. Returns how many guests were re-pinned.
    pub async fn cpuset_balance(&self) -> AgentResult<usize> {
        if !self.cpuset.is_enabled() {
            return Err(AgentError::precondition("cpu binding is disabled"));
        }
        Ok(self.cpuset.rebalance_once().await?)
    }

    pub async fn open_forward(&self, id: &str, req: OpenForwardRequest) -> AgentResult<ForwardInfo> {
        let (guest, _) = self.running(id).await?;
        let (net_id, ip) = vpc_endpoint(guest.lock().await.descriptor()?)?;

        let forward = self
            .forwarder
            .open(&OpenRequest {
                net_id,
                proto: req.proto,
                bind_addr: self.config.master_ip.clone(),
                remote_addr: req.addr.unwrap_or(ip),
                remote_port: req.port,
            })
            .await?;
        info!(guest_id = id, port = forward.bind_port, "forward opened");
        Ok(forward.into())
    }

    pub async fn close_forward(&self, id: &str, req: CloseForwardRequest) -> AgentResult<ForwardInfo> {
        let guest = self.guest(id)?;
        let (net_id, _) = vpc_endpoint(guest.lock().await.descriptor()?)?;

        let forward = self
            .forwarder
            .close(&CloseRequest {
                net_id,
                proto: req.proto,
                bind_addr: req.proxy_addr,
                bind_port: req.proxy_port,
            })
            .await?;
        info!(guest_id = id, port = forward.bind_port, "forward closed");
        Ok(forward.into())
    }

    pub async fn list_forwards(&self, id: &str, req: ListForwardsRequest) -> AgentResult<Vec<ForwardInfo>> {
        let (guest, _) = self.running(id).await?;
        let (net_id, ip) = vpc_endpoint(guest.lock().await.descriptor()?)?;

        let forwards = self
            .forwarder
            .list_by_remote(&ListByRemoteRequest {
                net_id,
                proto: req.proto,
                remote_addr: Some(req.addr.unwrap_or(ip)),
                remote_port: req.port,
            })
            .await?;
        Ok(forwards.into_iter().map(ForwardInfo::from).collect())
    }

    pub fn recent_actions(&self, id: &str, limit: usize) -> AgentResult<Vec<ActionLogEntry>> {
        Ok(self.action_log.recent(id, limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{
        storage::StorageKind,
        lifecycle::{STATUS_RUNNING, STATUS_STOPPED},
        testing::{TestAgent, descriptor, serve_fake_forwarder},
    };

    #[tokio::test]
    async fn test_monitor_command_requires_running() {
        let t = TestAgent::new().await;
        t.agent
            .create_guest("vm-1", Some(descriptor("vm-1", &["d1"])))
            .await
            .unwrap();
        let err = t.agent.monitor_command("vm-1", "info status").await.unwrap_err();
        assert_eq!(err.to_string(), "guest is not running");

        t.agent.start("vm-1", None).await.unwrap().task.unwrap().wait().await;
        let out = t.agent.monitor_command("vm-1", "info status").await.unwrap();
        assert_eq!(out, "ok: info status");
    }

    #[tokio::test]
    async fn test_monitor_command_reports_unreachable_channel() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.hypervisor.fail_connect(true);

        let err = t.agent.monitor_command("vm-1", "info status").await.unwrap_err();
        assert!(matches!(err, AgentError::Monitor(_)));
    }

    #[tokio::test]
    async fn test_io_throttle_every_drive() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1", "d2"]).await;

        t.agent.io_throttle("vm-1", 1024, 100).await.unwrap();
        let throttled: Vec<MonitorCommand> = t
            .hypervisor
            .commands("vm-1")
            .into_iter()
            .filter(|c| matches!(c, MonitorCommand::IoThrottle { .. }))
            .collect();
        assert_eq!(
            throttled,
            vec![
                MonitorCommand::IoThrottle {
                    drive: "drive_0".to_string(),
                    bps: 1024,
                    iops: 100
                },
                MonitorCommand::IoThrottle {
                    drive: "drive_1".to_string(),
                    bps: 1024,
                    iops: 100
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_online_resize_updates_descriptor() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;

        assert!(t.agent.online_resize_disk("vm-1", "d1", 10).await.unwrap_err().is_precondition());
        assert!(t.agent.online_resize_disk("vm-1", "nope", 20480).await.unwrap_err().is_precondition());

        t.agent.online_resize_disk("vm-1", "d1", 20480).await.unwrap();
        let guest = t.agent.registry().get("vm-1").unwrap();
        let on_disk = GuestDescriptor::load(guest.descriptor_path()).await.unwrap();
        assert_eq!(on_disk.disk("d1").unwrap().size_mb, 20480);
    }

    #[tokio::test]
    async fn test_hotplug_cpu_mem() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;

        let outcome = t.agent.hotplug_cpu_mem("vm-1", 2, 1024).await.unwrap().wait().await;
        assert_eq!(outcome, TaskOutcome::Succeeded(json!({ "cpu": 4, "mem_mb": 3072 })));

        let commands = t.hypervisor.commands("vm-1");
        assert!(commands.contains(&MonitorCommand::HotplugVcpu { index: 2 }));
        assert!(commands.contains(&MonitorCommand::HotplugVcpu { index: 3 }));
        assert!(commands.iter().any(|c| matches!(
            c,
            MonitorCommand::HotplugMemory { id, size_mb: 1024 } if id.starts_with("mem-")
        )));
    }

    #[tokio::test]
    async fn test_hotplug_overflow_is_rejected() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;

        let err = t.agent.hotplug_cpu_mem("vm-1", u32::MAX, 0).await.unwrap_err();
        assert!(err.is_precondition());
        let err = t.agent.hotplug_cpu_mem("vm-1", 0, u64::MAX).await.unwrap_err();
        assert!(err.is_precondition());

        assert!(
            !t.hypervisor
                .commands("vm-1")
                .iter()
                .any(|c| matches!(c, MonitorCommand::HotplugVcpu { .. } | MonitorCommand::HotplugMemory { .. }))
        );
        assert!(t.agent.tasks().active_for("vm-1").is_empty());
    }

    #[tokio::test]
    async fn test_hotplug_failure_keeps_descriptor() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.hypervisor.fail_command("HotplugMemory");

        let outcome = t.agent.hotplug_cpu_mem("vm-1", 1, 512).await.unwrap().wait().await;
        assert!(!outcome.is_success());
        let guest = t.agent.registry().get("vm-1").unwrap();
        assert_eq!(guest.lock().await.descriptor().unwrap().cpu, 2);
        assert_eq!(t.control_plane.statuses()[0].1, "hotplug_fail");
    }

    #[tokio::test]
    async fn test_clone_disk_rebinds_descriptor() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        let err = t
            .agent
            .storage_clone_disk("vm-1", "d1", "shared", "d1-copy")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot change disk storage on running/suspend guest");

        t.agent.stop("vm-1", None).await.unwrap().wait().await;
        let err = t
            .agent
            .storage_clone_disk("vm-1", "d1", "missing", "d1-copy")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));

        let outcome = t
            .agent
            .storage_clone_disk("vm-1", "d1", "shared", "d1-copy")
            .await
            .unwrap()
            .wait()
            .await;
        assert!(outcome.is_success());

        let guest = t.agent.registry().get("vm-1").unwrap();
        let guard = guest.lock().await;
        let disk = guard.descriptor().unwrap().disk("d1-copy").unwrap();
        assert_eq!(disk.storage_id, "shared");
        assert_eq!(disk.storage_kind, StorageKind::Shared);
        assert_eq!(disk.path, "/srv/disks/d1-copy.qcow2");
    }

    #[tokio::test]
    async fn test_reload_disk_snapshot() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.agent.reload_disk_snapshot("vm-1", "d1").await.unwrap();

        assert_eq!(
            t.hypervisor.commands("vm-1").last(),
            Some(&MonitorCommand::ReopenDrive {
                drive: "drive_0".to_string(),
                path: "/srv/disks/d1.qcow2".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_memory_snapshot_pauses_and_resumes() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.hypervisor.push_migrate_reply(json!({ "status": "active", "ram": { "total": 10, "transferred": 5 } }));

        let outcome = t.agent.memory_snapshot("vm-1", "ms-1").await.unwrap().wait().await;
        assert!(outcome.is_success());

        let path = t.agent.memory_snapshot_path("vm-1", "ms-1");
        assert!(path.starts_with(&t.agent.config().memory_snapshots_path));
        let commands = t.hypervisor.commands("vm-1");
        assert_eq!(commands.first(), Some(&MonitorCommand::Pause));
        assert_eq!(
            commands[1],
            MonitorCommand::SaveMemory {
                path: path.to_string_lossy().into_owned()
            }
        );
        assert_eq!(commands.last(), Some(&MonitorCommand::Resume));
        assert_eq!(
            commands.iter().filter(|c| **c == MonitorCommand::QueryMigrate).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_memory_snapshot_failure_still_resumes() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.hypervisor.push_migrate_reply(json!({ "status": "failed", "error-desc": "disk full" }));

        let outcome = t.agent.memory_snapshot("vm-1", "ms-1").await.unwrap().wait().await;
        assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.contains("disk full")));
        assert_eq!(t.hypervisor.commands("vm-1").last(), Some(&MonitorCommand::Resume));
    }

    #[tokio::test]
    async fn test_delete_memory_snapshot() {
        let t = TestAgent::new().await;
        let path = t.agent.memory_snapshot_path("vm-1", "ms-1");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"mem").await.unwrap();

        t.agent.delete_memory_snapshot("vm-1", "ms-1").await.unwrap();
        assert!(!path.exists());
        t.agent.delete_memory_snapshot("vm-1", "ms-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_memory_snapshot_boots_from_image() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.agent.stop("vm-1", None).await.unwrap().wait().await;

        let err = t.agent.reset_memory_snapshot("vm-1", "ms-1").await.unwrap_err();
        assert!(err.is_precondition());

        let path = t.agent.memory_snapshot_path("vm-1", "ms-1");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"mem").await.unwrap();

        let outcome = t.agent.reset_memory_snapshot("vm-1", "ms-1").await.unwrap().wait().await;
        assert!(outcome.is_success());
        assert_eq!(t.agent.status("vm-1").await, STATUS_RUNNING);

        let (_, opts) = t.hypervisor.launches().pop().unwrap();
        assert_eq!(opts.incoming, Some(format!("exec:cat {}", path.display())));
        assert_eq!(t.hypervisor.commands("vm-1").last(), Some(&MonitorCommand::Resume));

        let err = t.agent.reset_memory_snapshot("vm-1", "ms-1").await.unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn test_reset_memory_snapshot_kills_guest_that_will_not_resume() {
        let t = TestAgent::new().await;
        t.agent
            .create_guest("vm-1", Some(descriptor("vm-1", &["d1"])))
            .await
            .unwrap();
        let path = t.agent.memory_snapshot_path("vm-1", "ms-1");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"mem").await.unwrap();
        t.hypervisor.fail_command("Resume");

        let outcome = t.agent.reset_memory_snapshot("vm-1", "ms-1").await.unwrap().wait().await;
        assert!(!outcome.is_success());
        assert_eq!(t.agent.status("vm-1").await, STATUS_STOPPED);
        assert_eq!(t.hypervisor.terminated(), vec!["vm-1".to_string()]);
        assert_eq!(
            t.control_plane.statuses(),
            vec![("vm-1".to_string(), "memory_snapshot_reset_fail".to_string())]
        );
    }

    #[tokio::test]
    async fn test_cpu_set_validates_cores() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;

        assert!(t.agent.cpu_set("vm-1", vec![]).await.unwrap_err().is_precondition());
        assert!(t.agent.cpu_set("vm-1", vec![1, 9]).await.unwrap_err().is_precondition());
        assert!(matches!(
            t.agent.cpu_set("nope", vec![1]).await,
            Err(AgentError::NotFound(_))
        ));

        t.agent.cpu_set("vm-1", vec![1, 2]).await.unwrap();
        let pinned = t.agent.cpuset().assignment("vm-1").unwrap().unwrap();
        assert!(pinned.manual);
        assert_eq!(pinned.cores, vec![1, 2]);

        t.agent.cpu_set_remove("vm-1").await.unwrap();
        assert!(t.agent.cpuset().assignment("vm-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cpuset_balance_when_disabled() {
        let t = TestAgent::with_config(|c| c.enable_cpu_binding = false).await;
        assert!(t.agent.cpuset_balance().await.unwrap_err().is_precondition());
    }

    #[tokio::test]
    async fn test_forwards_open_list_close() {
        let t = TestAgent::new().await;
        let calls = serve_fake_forwarder(&t.agent.config().sdn_socket_path);
        t.running_guest("vm-1", &["d1"]).await;

        let opened = t
            .agent
            .open_forward(
                "vm-1",
                OpenForwardRequest {
                    proto: Proto::Tcp,
                    addr: None,
                    port: 22,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            opened,
            ForwardInfo {
                proto: Proto::Tcp,
                addr: "10.0.0.2".to_string(),
                port: 22,
                proxy_addr: "192.168.1.10".to_string(),
                proxy_port: 20000,
            }
        );

        let listed = t
            .agent
            .list_forwards("vm-1", ListForwardsRequest::default())
            .await
            .unwrap();
        assert_eq!(listed, vec![opened.clone()]);

        let closed = t
            .agent
            .close_forward(
                "vm-1",
                CloseForwardRequest {
                    proto: Proto::Tcp,
                    proxy_addr: opened.proxy_addr.clone(),
                    proxy_port: opened.proxy_port,
                },
            )
            .await
            .unwrap();
        assert_eq!(closed, opened);

        let err = t
            .agent
            .close_forward(
                "vm-1",
                CloseForwardRequest {
                    proto: Proto::Tcp,
                    proxy_addr: opened.proxy_addr,
                    proxy_port: opened.proxy_port,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Forward(_)));

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0]["params"]["net_id"], "net-1");
    }

    #[tokio::test]
    async fn test_recent_actions_after_tasks() {
        let t = TestAgent::new().await;
        t.running_guest("vm-1", &["d1"]).await;
        t.agent.stop("vm-1", None).await.unwrap().wait().await;

        let actions = t.agent.recent_actions("vm-1", 10).unwrap();
        let mut names: Vec<&str> = actions.iter().map(|a| a.action.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["start", "stop"]);
        assert!(actions.iter().all(|a| a.success));
    }
}
